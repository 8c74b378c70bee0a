//! `chart-cnn` library crate.
//!
//! Price windows are rendered into small black-and-white chart images, a
//! convolutional classifier is trained on them, and its scores are collected
//! into a per-symbol, per-date "up factor" table. The binary (`chart-cnn`) is a thin wrapper around this library
//! so the pipeline is testable without spawning processes.

pub mod app;
pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod inference;
pub mod io;
pub mod math;
pub mod models;
pub mod render;
pub mod report;
pub mod train;
