#[cfg(feature = "loom")]
mod models;

#[cfg(not(feature = "loom"))]
mod unit_tests;
