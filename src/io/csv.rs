/*!
# CSV export of chains

Enable via the `csv` feature.

A chain file has one column per parameter, named after the parameter, plus a
final `likelihood` column holding the NLL of each stored state. Files written
for several experiments carry two leading columns, `experiment` and `step`.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::chain::ChainBuffer;
use crate::core::Experiment;
use crate::error::Result;

fn header(chain: &ChainBuffer) -> Vec<String> {
    let mut header = chain.names().to_vec();
    header.push("likelihood".to_string());
    header
}

/**
Saves the filled rows of a chain as a CSV file.

# Examples

```rust
use sxfit::chain::ChainBuffer;
use sxfit::io::csv::save_chain_csv;

let mut chain = ChainBuffer::new(vec!["b8".into(), "e_scale".into()], 2);
chain.push(&[100.0, 0.01], 12.5).unwrap();
chain.push(&[101.0, 0.02], 12.25).unwrap();

let path = std::env::temp_dir().join("sxfit_doc_chain.csv");
save_chain_csv(&chain, &path).unwrap();
let text = std::fs::read_to_string(&path).unwrap();
assert!(text.starts_with("b8,e_scale,likelihood"));
```
*/
pub fn save_chain_csv(chain: &ChainBuffer, path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(header(chain))?;
    for row in chain.rows().rows() {
        wtr.write_record(row.iter().map(|v| v.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Saves the chains of several experiments into one CSV file, with
/// `experiment` and `step` columns in front of each row.
pub fn save_experiments_csv(experiments: &[Experiment], path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let mut head = vec!["experiment".to_string(), "step".to_string()];
    if let Some(first) = experiments.first() {
        head.extend(header(&first.run.chain));
    }
    wtr.write_record(&head)?;

    for experiment in experiments {
        for (step, row) in experiment.run.chain.rows().rows().into_iter().enumerate() {
            let mut record = vec![experiment.index.to_string(), step.to_string()];
            record.extend(row.iter().map(|v| v.to_string()));
            wtr.write_record(&record)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ChainRun;
    use csv::Reader;
    use std::fs;
    use tempfile::NamedTempFile;

    fn chain(rows: &[[f64; 3]]) -> ChainBuffer {
        let mut chain = ChainBuffer::new(vec!["a".into(), "b".into()], rows.len() + 1);
        for r in rows {
            chain.push(&r[..2], r[2]).unwrap();
        }
        chain
    }

    #[test]
    fn test_empty_chain_writes_header_only() {
        let file = NamedTempFile::new().unwrap();
        save_chain_csv(&chain(&[]), file.path()).unwrap();
        let contents = fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents.trim(), "a,b,likelihood");
    }

    #[test]
    fn test_rows_round_trip_through_reader() {
        let file = NamedTempFile::new().unwrap();
        let c = chain(&[[1.0, 2.0, 3.5], [4.0, 5.0, 6.25]]);
        save_chain_csv(&c, file.path()).unwrap();

        let mut rdr = Reader::from_path(file.path()).unwrap();
        let records: Vec<Vec<f64>> = rdr
            .records()
            .map(|r| r.unwrap().iter().map(|v| v.parse().unwrap()).collect())
            .collect();
        // Only filled rows are written, not the spare capacity.
        assert_eq!(records, vec![vec![1.0, 2.0, 3.5], vec![4.0, 5.0, 6.25]]);
    }

    #[test]
    fn test_experiments_file() {
        let file = NamedTempFile::new().unwrap();
        let experiments: Vec<Experiment> = (0..2)
            .map(|e| Experiment {
                index: e,
                seed: e as u64,
                n_events: 0,
                run: ChainRun {
                    chain: chain(&[[e as f64, 0.0, 1.0], [e as f64, 1.0, 2.0]]),
                    accepted: 1,
                    seed: 0,
                },
            })
            .collect();
        save_experiments_csv(&experiments, file.path()).unwrap();

        let contents = fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "experiment,step,a,b,likelihood");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], "1,1,1,1,2");
    }
}
