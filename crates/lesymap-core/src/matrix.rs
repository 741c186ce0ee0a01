//! Subjects × columns lesion matrix.

use nalgebra::DMatrix;

use crate::error::{MappingError, MappingResult};

/// N×P lesion matrix stored column-major, so each column is one contiguous
/// slice of length N.
#[derive(Debug, Clone, PartialEq)]
pub struct LesionMatrix {
    n_subjects: usize,
    n_columns: usize,
    data: Vec<f64>,
}

impl LesionMatrix {
    /// Build from P columns of length N.
    pub fn from_columns(n_subjects: usize, columns: &[Vec<f64>]) -> MappingResult<Self> {
        let mut data = Vec::with_capacity(n_subjects * columns.len());
        for (j, column) in columns.iter().enumerate() {
            if column.len() != n_subjects {
                return Err(MappingError::shape(format!(
                    "column {j} has {} values, expected {n_subjects}",
                    column.len()
                )));
            }
            data.extend_from_slice(column);
        }
        Ok(Self {
            n_subjects,
            n_columns: columns.len(),
            data,
        })
    }

    /// Build from N rows of length P.
    pub fn from_rows(rows: &[Vec<f64>]) -> MappingResult<Self> {
        let n_subjects = rows.len();
        let n_columns = rows.first().map_or(0, Vec::len);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_columns) {
            return Err(MappingError::shape(format!(
                "row {i} has {} values, expected {n_columns}",
                row.len()
            )));
        }
        let mut data = vec![0.0; n_subjects * n_columns];
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                data[j * n_subjects + i] = v;
            }
        }
        Ok(Self {
            n_subjects,
            n_columns,
            data,
        })
    }

    pub(crate) fn from_raw(n_subjects: usize, n_columns: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), n_subjects * n_columns);
        Self {
            n_subjects,
            n_columns,
            data,
        }
    }

    pub fn n_subjects(&self) -> usize {
        self.n_subjects
    }

    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    pub fn column(&self, j: usize) -> &[f64] {
        &self.data[j * self.n_subjects..(j + 1) * self.n_subjects]
    }

    pub fn value(&self, subject: usize, column: usize) -> f64 {
        self.data[column * self.n_subjects + subject]
    }

    pub fn columns(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_columns).map(move |j| self.column(j))
    }

    /// Per-subject sum over columns, each column counted `weights[j]` times.
    pub fn weighted_row_sums(&self, weights: &[usize]) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_subjects];
        for (j, &w) in weights.iter().enumerate().take(self.n_columns) {
            for (sum, v) in sums.iter_mut().zip(self.column(j)) {
                *sum += v * w as f64;
            }
        }
        sums
    }

    /// Multiply every value of subject `i` by `factors[i]`.
    pub fn scale_rows(&mut self, factors: &[f64]) {
        let n = self.n_subjects;
        for column in self.data.chunks_mut(n.max(1)) {
            for (v, f) in column.iter_mut().zip(factors) {
                *v *= f;
            }
        }
    }

    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(self.n_subjects, self.n_columns, &self.data)
    }

    /// Rows restricted to `subjects`, in the given order.
    pub fn select_rows(&self, subjects: &[usize]) -> Self {
        let mut data = Vec::with_capacity(subjects.len() * self.n_columns);
        for column in self.columns() {
            data.extend(subjects.iter().map(|&i| column[i]));
        }
        Self::from_raw(subjects.len(), self.n_columns, data)
    }
}
