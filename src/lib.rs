// THEORY:
// This file is the main entry point for the `retina_screen` library crate.
// It defines the public API exposed to consumers such as a serving layer that
// accepts fundus uploads and returns JSON.
//
// The primary goal is to export the `ScreeningPipeline` and its associated data
// structures (`ScreeningConfig`, `ScreeningReport`, `Analysis`) as the high-level
// interface, plus the `ScreeningService` async front end. The three core stages
// (normalizer, severity mapper, saliency generator) and the model capability traits
// live in `core_modules` and remain usable on their own.

pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod service;

pub use core_modules::model::{ObservableLayer, RegressionModel, SharedModel};
pub use error::{Error, Result};
pub use pipeline::{Analysis, ScreeningConfig, ScreeningPipeline, ScreeningReport};
pub use service::ScreeningService;
