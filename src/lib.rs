//! # oncoembed
//!
//! A research pipeline for hepatocellular-carcinoma progression studies. It
//! loads a clinical table and per-patient PNG tiles, performs deterministic
//! train/test splitting, embeds both modalities (a fitted feature-projection
//! model for tabular data, a simulated quanvolutional circuit for images),
//! and persists every artifact with row-order-aligned id/label tables so a
//! downstream model can consume them without re-deriving the pairing.
//!
//! The binary exposes four subcommands: `generate-data`, `train`, `test`,
//! and `cross-validate`. The library surface mirrors that split: raw-input
//! loading in [`data`] and [`quanv`], partitioning in [`split`], embedding
//! behind the [`embed::Embedder`] trait, artifact IO in [`persist`], and
//! orchestration in [`pipeline`].

pub mod config;
pub mod data;
pub mod embed;
pub mod metrics;
pub mod persist;
pub mod pipeline;
pub mod quanv;
pub mod split;
pub mod trainer;
