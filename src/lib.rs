#![allow(non_snake_case)]
#![allow(clippy::too_many_arguments)]

// Declare the modules that form the library's public API (or internal structure)
// Using `pub mod` makes them accessible from the binaries using `use ReceiptFlow::module_name;`
pub mod clients;
pub mod config;
pub mod data_model;
pub mod documents;
pub mod error;
pub mod messaging;
pub mod processing;
pub mod stages;
pub mod utils;

pub mod server;
