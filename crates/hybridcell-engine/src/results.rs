//! Combined trajectory of all modules and its tab-separated rendering.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use hybridcell_core::{matrix, Result, Time};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Layout of the TSV artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsvOptions {
    /// First line lists species identifiers
    pub header: bool,
    /// First column holds the timepoint
    pub time_column: bool,
}

/// One row per timepoint, one column per species of every module in
/// instantiation order
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResults {
    pub timepoints: Vec<Time>,
    pub species_ids: Vec<String>,
    /// Identity of the module owning each column
    pub module_ids: Vec<String>,
    pub matrix: Array2<f64>,
}

impl SimulationResults {
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    /// Column of species `id` from module `module`
    pub fn column(&self, module: &str, id: &str) -> Option<Vec<f64>> {
        let index = self
            .module_ids
            .iter()
            .zip(&self.species_ids)
            .position(|(m, s)| m == module && s == id)?;
        Some(matrix::column(&self.matrix, index))
    }

    /// Final row
    pub fn final_state(&self) -> Option<Vec<f64>> {
        let last = self.matrix.nrows().checked_sub(1)?;
        Some(self.matrix.row(last).to_vec())
    }

    pub fn write_tsv<W: Write>(&self, writer: &mut W, options: TsvOptions) -> Result<()> {
        if options.header {
            let mut fields: Vec<&str> = Vec::with_capacity(self.species_ids.len() + 1);
            if options.time_column {
                fields.push("time");
            }
            fields.extend(self.species_ids.iter().map(String::as_str));
            writeln!(writer, "{}", fields.join("\t"))?;
        }

        for (k, row) in self.matrix.rows().into_iter().enumerate() {
            let mut fields: Vec<String> = Vec::with_capacity(row.len() + 1);
            if options.time_column {
                let t = self.timepoints.get(k).copied().unwrap_or(f64::NAN);
                fields.push(t.to_string());
            }
            fields.extend(row.iter().map(|v| v.to_string()));
            writeln!(writer, "{}", fields.join("\t"))?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn save_tsv(&self, path: impl AsRef<Path>, options: TsvOptions) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_tsv(&mut writer, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn results() -> SimulationResults {
        SimulationResults {
            timepoints: vec![0.0, 0.5],
            species_ids: vec!["TF".into(), "mRNA".into()],
            module_ids: vec!["Deterministic".into(), "Stochastic".into()],
            matrix: array![[10.0, 0.0], [9.5, 3.0]],
        }
    }

    #[test]
    fn test_column_lookup() {
        let r = results();
        assert_eq!(r.column("Stochastic", "mRNA"), Some(vec![0.0, 3.0]));
        assert_eq!(r.column("Deterministic", "mRNA"), None);
        assert_eq!(r.final_state(), Some(vec![9.5, 3.0]));
    }

    #[test]
    fn test_tsv_plain() {
        let mut out = Vec::new();
        results().write_tsv(&mut out, TsvOptions::default()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "10\t0\n9.5\t3\n");
    }

    #[test]
    fn test_tsv_with_header_and_time() {
        let mut out = Vec::new();
        let options = TsvOptions {
            header: true,
            time_column: true,
        };
        results().write_tsv(&mut out, options).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "time\tTF\tmRNA\n0\t10\t0\n0.5\t9.5\t3\n"
        );
    }

    #[test]
    fn test_save_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.tsv");
        results()
            .save_tsv(&path, TsvOptions { header: true, time_column: false })
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.lines().next(), Some("TF\tmRNA"));
    }
}
