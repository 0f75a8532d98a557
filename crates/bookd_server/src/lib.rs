//! HTTP surface of the book synthesis pipeline. The desktop GUI talks to
//! this server; it never links the pipeline directly.

pub mod controller;
pub mod metric;
