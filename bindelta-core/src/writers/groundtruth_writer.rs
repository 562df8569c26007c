//! Groundtruth writer
//!
//! One line per function fixed point:
//! `PRIMARY_HEX SECONDARY_HEX PRIMARY_NAME SECONDARY_NAME`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::matching::context::MatchingContext;
use crate::util::format_address;
use crate::writers::ResultWriter;

pub struct GroundtruthWriter {
    path: PathBuf,
}

impl GroundtruthWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GroundtruthWriter { path: path.into() }
    }
}

impl ResultWriter for GroundtruthWriter {
    fn write(&mut self, context: &MatchingContext) -> Result<()> {
        let mut out = BufWriter::new(File::create(&self.path)?);
        for fixed_point in context.fixed_points.iter() {
            let primary = context.primary.flow_graph(fixed_point.primary());
            let secondary = context.secondary.flow_graph(fixed_point.secondary());
            writeln!(
                out,
                "{} {} {} {}",
                format_address(primary.entry_point()),
                format_address(secondary.entry_point()),
                primary.name(),
                secondary.name(),
            )?;
        }
        out.flush()?;
        Ok(())
    }
}
