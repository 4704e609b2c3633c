//! Strata command-line front end.

pub mod cli;
