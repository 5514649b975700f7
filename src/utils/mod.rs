//! The `utils` module collects the pieces shared by every other module of
//! `groupfeed`: the crate error type and logging initialisation.

pub mod error;
pub mod logging;
