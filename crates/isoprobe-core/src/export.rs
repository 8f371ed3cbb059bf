//! Report export seam.
//!
//! Verification hands its tallies to an [`Exporter`]; the CLI plugs in
//! a CSV writer, tests and library users get [`NullExporter`].

use isoprobe_error::Result;

/// Sink for `name,value,unit` report rows.
pub trait Exporter {
    fn record(&mut self, name: &str, value: &str, unit: &str) -> Result<()>;
}

/// Discards every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExporter;

impl Exporter for NullExporter {
    fn record(&mut self, _name: &str, _value: &str, _unit: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory exporter for tests.
#[derive(Debug, Default)]
pub struct VecExporter {
    pub rows: Vec<(String, String, String)>,
}

impl Exporter for VecExporter {
    fn record(&mut self, name: &str, value: &str, unit: &str) -> Result<()> {
        self.rows
            .push((name.to_owned(), value.to_owned(), unit.to_owned()));
        Ok(())
    }
}
