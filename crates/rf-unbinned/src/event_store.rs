//! Columnar event storage and fixed-size batching.

use rand::RngCore;
use rand::seq::SliceRandom;
use rf_core::{Error, Result};
use std::collections::BTreeMap;

/// Columnar event table (Structure-of-Arrays).
///
/// Columns are named `f64` vectors of equal length. An optional per-event label records
/// which source produced a simulated event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    n_events: usize,
    columns: BTreeMap<String, Vec<f64>>,
    labels: Option<Vec<String>>,
}

impl EventTable {
    /// Table with no columns and no events.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from materialized columns.
    pub fn from_columns(columns: impl IntoIterator<Item = (String, Vec<f64>)>) -> Result<Self> {
        let mut n_events: Option<usize> = None;
        let mut by_name = BTreeMap::new();
        for (name, col) in columns {
            match n_events {
                Some(n) if n != col.len() => {
                    return Err(Error::Validation(format!(
                        "column length mismatch for '{name}': expected {n}, got {}",
                        col.len()
                    )));
                }
                _ => n_events = Some(col.len()),
            }
            if by_name.insert(name.clone(), col).is_some() {
                return Err(Error::Validation(format!("duplicate column '{name}'")));
            }
        }
        Ok(Self { n_events: n_events.unwrap_or(0), columns: by_name, labels: None })
    }

    /// Attach one label per event.
    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.n_events {
            return Err(Error::Validation(format!(
                "labels length mismatch: expected {}, got {}",
                self.n_events,
                labels.len()
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Label every event with `label`.
    pub fn with_label(self, label: &str) -> Self {
        let n = self.n_events;
        Self { labels: Some(vec![label.to_string(); n]), ..self }
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// Whether the table holds no events.
    pub fn is_empty(&self) -> bool {
        self.n_events == 0
    }

    /// Column names, sorted.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Column by name, or a validation error naming the missing column.
    pub fn require_column(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| Error::Validation(format!("event table has no column '{name}'")))
    }

    /// Per-event labels, if any.
    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Concatenate tables row-wise.
    ///
    /// The result has the union of all columns; a column missing from one of the inputs is
    /// filled with NaN for that input's rows. Unlabelled rows get an empty label when any
    /// input is labelled.
    pub fn concat(tables: &[EventTable]) -> Self {
        let n_events: usize = tables.iter().map(|t| t.n_events).sum();
        let mut names: Vec<&str> = tables.iter().flat_map(|t| t.column_names()).collect();
        names.sort_unstable();
        names.dedup();

        let mut columns = BTreeMap::new();
        for name in names {
            let mut col = Vec::with_capacity(n_events);
            for t in tables {
                match t.column(name) {
                    Some(c) => col.extend_from_slice(c),
                    None => col.extend(std::iter::repeat_n(f64::NAN, t.n_events)),
                }
            }
            columns.insert(name.to_string(), col);
        }

        let labels = tables.iter().any(|t| t.labels.is_some()).then(|| {
            tables
                .iter()
                .flat_map(|t| match &t.labels {
                    Some(l) => l.clone(),
                    None => vec![String::new(); t.n_events],
                })
                .collect()
        });

        Self { n_events, columns, labels }
    }

    /// Rows where `keep` is true, in order.
    pub fn select_rows(&self, keep: &[bool]) -> Result<Self> {
        if keep.len() != self.n_events {
            return Err(Error::Validation(format!(
                "row mask length mismatch: expected {}, got {}",
                self.n_events,
                keep.len()
            )));
        }
        let pick = |col: &Vec<f64>| -> Vec<f64> {
            col.iter().zip(keep).filter(|&(_, &k)| k).map(|(&v, _)| v).collect()
        };
        Ok(Self {
            n_events: keep.iter().filter(|&&k| k).count(),
            columns: self.columns.iter().map(|(n, c)| (n.clone(), pick(c))).collect(),
            labels: self.labels.as_ref().map(|l| {
                l.iter().zip(keep).filter(|&(_, &k)| k).map(|(s, _)| s.clone()).collect()
            }),
        })
    }

    /// Permute the rows uniformly at random.
    pub fn shuffle(&mut self, rng: &mut dyn RngCore) {
        let mut perm: Vec<usize> = (0..self.n_events).collect();
        perm.shuffle(rng);
        for col in self.columns.values_mut() {
            *col = perm.iter().map(|&i| col[i]).collect();
        }
        if let Some(labels) = &mut self.labels {
            *labels = perm.iter().map(|&i| labels[i].clone()).collect();
        }
    }
}

/// Batching metadata of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batching {
    /// Events per batch.
    pub batch_size: usize,
    /// Number of batches, `ceil(n_events / batch_size)`.
    pub n_batches: usize,
    /// Padding rows appended to the final batch.
    pub n_padding: usize,
}

impl Batching {
    /// Batching for `n_events` events.
    pub fn new(n_events: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        let n_batches = n_events.div_ceil(batch_size);
        Ok(Self { batch_size, n_batches, n_padding: n_batches * batch_size - n_events })
    }

    /// Batching of a dataset without data.
    pub fn deferred(batch_size: usize) -> Self {
        Self { batch_size, n_batches: 0, n_padding: 0 }
    }

    /// Number of real events.
    pub fn n_events(&self) -> usize {
        self.n_batches * self.batch_size - self.n_padding
    }

    /// Number of real (unpadded) rows in batch `i_batch`.
    ///
    /// Padding sits at the end of the final batch.
    pub fn effective_len(&self, i_batch: usize) -> usize {
        if i_batch + 1 == self.n_batches {
            self.batch_size - self.n_padding
        } else {
            self.batch_size
        }
    }
}

/// Selected columns of an [`EventTable`], padded to a whole number of batches.
///
/// Padding rows repeat the last real event so every batch evaluates on valid inputs.
#[derive(Debug, Clone)]
pub struct BatchedEvents {
    batching: Batching,
    columns: BTreeMap<String, Vec<f64>>,
}

impl BatchedEvents {
    /// Pad `columns` of `table` into batches of `batch_size`.
    pub fn new(table: &EventTable, columns: &[&str], batch_size: usize) -> Result<Self> {
        let batching = Batching::new(table.n_events(), batch_size)?;
        let padded_len = batching.n_batches * batch_size;
        let mut out = BTreeMap::new();
        for &name in columns {
            let src = table.require_column(name)?;
            let mut col = Vec::with_capacity(padded_len);
            col.extend_from_slice(src);
            if let Some(&last) = src.last() {
                col.resize(padded_len, last);
            }
            out.insert(name.to_string(), col);
        }
        Ok(Self { batching, columns: out })
    }

    /// Batching metadata.
    pub fn batching(&self) -> Batching {
        self.batching
    }

    /// Rows of column `name` belonging to batch `i_batch` (always `batch_size` long).
    pub fn batch(&self, name: &str, i_batch: usize) -> Result<&[f64]> {
        if i_batch >= self.batching.n_batches {
            return Err(Error::Validation(format!(
                "batch {i_batch} out of range ({} batches)",
                self.batching.n_batches
            )));
        }
        let col = self
            .columns
            .get(name)
            .ok_or_else(|| Error::Validation(format!("column '{name}' was not batched")))?;
        let bs = self.batching.batch_size;
        Ok(&col[i_batch * bs..(i_batch + 1) * bs])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn table(xs: &[f64]) -> EventTable {
        EventTable::from_columns(vec![("x".to_string(), xs.to_vec())]).unwrap()
    }

    #[test]
    fn test_from_columns_validates_lengths() {
        let err = EventTable::from_columns(vec![
            ("x".to_string(), vec![1.0, 2.0]),
            ("y".to_string(), vec![1.0]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(table(&[]).is_empty());
    }

    #[test]
    fn test_batching_padding() {
        let b = Batching::new(23, 10).unwrap();
        assert_eq!((b.n_batches, b.n_padding), (3, 7));
        assert_eq!(b.effective_len(0), 10);
        assert_eq!(b.effective_len(1), 10);
        assert_eq!(b.effective_len(2), 3);
        assert_eq!(b.n_events(), 23);

        let exact = Batching::new(20, 10).unwrap();
        assert_eq!((exact.n_batches, exact.n_padding), (2, 0));
        assert_eq!(exact.effective_len(1), 10);

        let none = Batching::new(0, 10).unwrap();
        assert_eq!((none.n_batches, none.n_padding), (0, 0));
        assert!(Batching::new(5, 0).is_err());
    }

    #[test]
    fn test_padding_repeats_last_event() {
        let t = table(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = BatchedEvents::new(&t, &["x"], 2).unwrap();
        assert_eq!(b.batching().n_batches, 3);
        assert_eq!(b.batch("x", 0).unwrap(), &[1.0, 2.0]);
        assert_eq!(b.batch("x", 2).unwrap(), &[5.0, 5.0]);
        assert!(b.batch("x", 3).is_err());
        assert!(b.batch("y", 0).is_err());
        assert!(BatchedEvents::new(&t, &["y"], 2).is_err());
    }

    #[test]
    fn test_concat_fills_missing_columns() {
        let a = table(&[1.0, 2.0]).with_label("a");
        let b = EventTable::from_columns(vec![("y".to_string(), vec![7.0])]).unwrap().with_label("b");
        let c = EventTable::concat(&[a, b]);
        assert_eq!(c.n_events(), 3);
        let x = c.column("x").unwrap();
        assert_eq!(&x[..2], &[1.0, 2.0]);
        assert!(x[2].is_nan());
        let y = c.column("y").unwrap();
        assert!(y[0].is_nan() && y[1].is_nan());
        assert_eq!(y[2], 7.0);
        assert_eq!(c.labels().unwrap(), &["a", "a", "b"]);
        assert_eq!(EventTable::concat(&[]), EventTable::empty());
    }

    #[test]
    fn test_select_rows() {
        let t = table(&[1.0, 2.0, 3.0]).with_label("s");
        let kept = t.select_rows(&[true, false, true]).unwrap();
        assert_eq!(kept.n_events(), 2);
        assert_eq!(kept.column("x").unwrap(), &[1.0, 3.0]);
        assert_eq!(kept.labels().unwrap().len(), 2);
        assert!(t.select_rows(&[true]).is_err());
    }

    #[test]
    fn test_shuffle_keeps_rows_together() {
        let xs: Vec<f64> = (0..50).map(f64::from).collect();
        let labels: Vec<String> = xs.iter().map(|x| format!("{x}")).collect();
        let mut t = table(&xs).with_labels(labels).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        t.shuffle(&mut rng);
        let col = t.column("x").unwrap();
        assert_ne!(col, xs.as_slice());
        for (x, l) in col.iter().zip(t.labels().unwrap()) {
            assert_eq!(format!("{x}"), *l);
        }
        let mut sorted = col.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, xs);
    }
}
