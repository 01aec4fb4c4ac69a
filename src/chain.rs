//! Preallocated storage for the states visited by a chain.
//!
//! Each row holds one parameter vector followed by its NLL, so the buffer is
//! `capacity x (n_parameters + 1)`, filled row by row.

use ndarray::{Array2, ArrayView2};

use crate::error::{FitError, Result};

/// Row-major chain storage with a fill cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainBuffer {
    names: Vec<String>,
    data: Array2<f64>,
    len: usize,
}

impl ChainBuffer {
    /// A buffer for `capacity` rows of the parameters called `names`.
    pub fn new(names: Vec<String>, capacity: usize) -> Self {
        let width = names.len() + 1;
        Self {
            names,
            data: Array2::zeros((capacity, width)),
            len: 0,
        }
    }

    /// Appends one state and its NLL.
    ///
    /// # Errors
    /// [`FitError::ChainFull`] once every row is used, and a dimension error
    /// for a vector of the wrong length.
    pub fn push(&mut self, pars: &[f64], nll: f64) -> Result<()> {
        if self.is_full() {
            return Err(FitError::ChainFull(self.capacity()));
        }
        if pars.len() != self.n_parameters() {
            return Err(FitError::DimensionMismatch(format!(
                "cannot store {} parameters in a chain of {}",
                pars.len(),
                self.n_parameters()
            )));
        }
        let mut row = self.data.row_mut(self.len);
        for (dst, &src) in row.iter_mut().zip(pars) {
            *dst = src;
        }
        row[pars.len()] = nll;
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn n_parameters(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The filled rows, parameters then NLL.
    pub fn rows(&self) -> ArrayView2<'_, f64> {
        self.data.slice(ndarray::s![..self.len, ..])
    }

    /// Parameter vector stored at step `i`.
    pub fn parameters(&self, i: usize) -> Vec<f64> {
        self.data.row(i).iter().take(self.n_parameters()).copied().collect()
    }

    /// All filled values of parameter `k`.
    pub fn column(&self, k: usize) -> Vec<f64> {
        self.rows().column(k).to_vec()
    }

    /// All filled NLL values.
    pub fn nll(&self) -> Vec<f64> {
        self.column(self.n_parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_push_fills_rows_in_order() {
        let mut chain = ChainBuffer::new(names(), 3);
        assert!(chain.is_empty());
        chain.push(&[1.0, 2.0], 10.0).unwrap();
        chain.push(&[3.0, 4.0], 9.0).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.rows().shape(), &[2, 3]);
        assert_eq!(chain.parameters(1), vec![3.0, 4.0]);
        assert_eq!(chain.column(0), vec![1.0, 3.0]);
        assert_eq!(chain.nll(), vec![10.0, 9.0]);
    }

    #[test]
    fn test_full_buffer_rejects_rows() {
        let mut chain = ChainBuffer::new(names(), 1);
        chain.push(&[0.0, 0.0], 1.0).unwrap();
        assert!(chain.is_full());
        assert!(matches!(
            chain.push(&[0.0, 0.0], 1.0),
            Err(FitError::ChainFull(1))
        ));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let mut chain = ChainBuffer::new(names(), 2);
        assert!(chain.push(&[1.0], 0.0).is_err());
        assert!(chain.is_empty());
    }
}
