//! Command-line front end over an in-process snapmirror database

pub mod cmd;
pub mod util;
