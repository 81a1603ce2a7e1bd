//! This crate exposes the internal functionality of the `rangeping` latency
//! ranking tool.
//!
//! rangeping takes a list of address ranges (CIDR blocks, single addresses and
//! `address:port` pairs), expands it into concrete endpoints, probes every
//! endpoint with a bounded number of probes in flight and reports the reachable
//! ones ordered by average latency.
//!
//! ## Architecture Overview
//!
//! 1. **Input Processing**: [`input::Opts`] and [`input::Config`] are merged and
//!    validated into a [`input::ScanConfig`].
//! 2. **Expansion**: [`address::load_targets`] reads a [`address::TargetSource`]
//!    and expands each range with a [`address::RangeExpander`], deduplicating by
//!    `address:port`.
//! 3. **Probing**: a [`scanner::Prober`] runs the chosen [`probe::Probe`]
//!    against every target, at most `concurrency` targets at a time.
//! 4. **Result Processing**: the [`scanner::ResultSet`] comes back sorted by
//!    average delay and can be narrowed with a [`scanner::ResultFilter`].
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rangeping::address::{load_targets, RangeExpander, TargetSource};
//! use rangeping::input::{ProbeMode, ScanConfig};
//! use rangeping::probe;
//! use rangeping::scanner::Prober;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScanConfig {
//!         mode: ProbeMode::Tcp,
//!         ..ScanConfig::default()
//!     };
//!
//!     let source = TargetSource::Inline("1.1.1.0/30,[2606:4700::1111]:2053".to_owned());
//!     let targets = load_targets(&source, &RangeExpander::new(true), config.port).await?;
//!
//!     let results = Prober::new(probe::pick(&config), &config)
//!         .run(targets.as_slice())
//!         .await;
//!
//!     for result in &results {
//!         println!("{} {:?}", result.target, result.average_delay);
//!     }
//!     Ok(())
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod input;

pub mod address;

pub mod probe;

pub mod scanner;
