//! Result writers
//!
//! Persist a finished diff: a relational database loadable by UI
//! front-ends, a human-readable text report, and a plain groundtruth
//! listing. The chain writer fans one diff out to any combination of
//! them.

pub mod database;
pub mod groundtruth_writer;
pub mod log_writer;

use crate::error::Result;
use crate::matching::context::MatchingContext;

/// Sink for one finished diff.
pub trait ResultWriter {
    fn write(&mut self, context: &MatchingContext) -> Result<()>;
}

/// Writes a diff to every added writer in order.
#[derive(Default)]
pub struct ChainWriter {
    writers: Vec<Box<dyn ResultWriter>>,
}

impl ChainWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, writer: Box<dyn ResultWriter>) {
        self.writers.push(writer);
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl ResultWriter for ChainWriter {
    fn write(&mut self, context: &MatchingContext) -> Result<()> {
        for writer in &mut self.writers {
            writer.write(context)?;
        }
        Ok(())
    }
}
