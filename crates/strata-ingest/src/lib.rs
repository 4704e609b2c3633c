#![warn(missing_docs)]

//! Strata ingest subsystem: grammar induction, ingestion and export.
//!
//! Ingest path: symbols → bulk leaves → digram grammar (in memory) → rule composites → root
//! Export path: root → batched level loads → memoised post-order expansion → symbols

pub mod config;
pub mod error;
pub mod export;
pub mod grammar;
pub mod parallel;
pub mod pipeline;
pub mod symbols;

pub use config::StrataConfig;
pub use error::{IngestError, InduceError, Result};
pub use export::{ExportConfig, ExportEngine, Expansion, RoundTrip};
pub use grammar::{Arena, GrammarInducer, InducerConfig, Induction, Rule};
pub use parallel::{ParallelConfig, ParallelIngestor, ParallelStats};
pub use pipeline::{IngestOutcome, IngestStats, IngestionPipeline, LeafSource};
pub use symbols::{float_symbols, integer_symbols, symbols_to_text, text_symbols, utf16_symbols};
