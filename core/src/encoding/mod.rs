//! Text-safe binary encodings used on the advertising transport

pub mod csiro85;

pub use csiro85::{Csiro85Error, CSIRO85_BASE, CSIRO85_OFFSET};
