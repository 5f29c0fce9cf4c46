//! oasfuzz library
//!
//! Contract-driven black-box fuzzing for HTTP services described by an
//! OpenAPI 3.x document: load the contract, synthesize randomized requests
//! that conform to it, replay them against a live target and persist every
//! exchange whose response violates the contract.

pub mod auth;
pub mod cli;
pub mod config;
pub mod contract;
pub mod fuzz;
pub mod generate;
pub mod logging;
pub mod request;
