//! Terminal output helpers shared by the library and the binary.
use colored::Colorize;
use std::fmt;

/// Line prefixes of the three kinds of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Warning,
    Detail,
    Output,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Warning => "[!]".red().bold(),
            Self::Detail => "[~]".blue().bold(),
            Self::Output => "[>]".green().bold(),
        };
        write!(f, "{tag}")
    }
}

/// Something went wrong but the run goes on.
#[macro_export]
macro_rules! warning {
    ($name:expr) => {
        println!("{} {}", $crate::tui::Tag::Warning, $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        // if not greppable then print, otherwise no else statement so do not print.
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::Tag::Warning, $name);
            }
        }
    };
}

/// Information about the run itself.
#[macro_export]
macro_rules! detail {
    ($name:expr) => {
        println!("{} {}", $crate::tui::Tag::Detail, $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::Tag::Detail, $name);
            }
        }
    };
}

/// A result line.
#[macro_export]
macro_rules! output {
    ($name:expr) => {
        println!("{} {}", $crate::tui::Tag::Output, $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::Tag::Output, $name);
            }
        }
    };
}
