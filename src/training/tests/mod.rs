//! Test suite for the distillation training engine
//!
//! Unit tests live next to each module; this suite covers behaviour that spans
//! several of them: the data pipeline, the loss engine against real and
//! fixed-logit models, checkpoint retention, and full training runs.

pub mod fixtures;

mod trainer_tests;
