//! Console front end for the peripheral session.

pub mod console;
