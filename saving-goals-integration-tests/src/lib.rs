//! Integration tests for the saving goals service
//!
//! This crate contains end-to-end tests that run the domain crate, the
//! in-memory store and the service wiring together.

// This is a test-only crate
#![cfg(test)]
