//! Axis-aligned measurement grid and nearest-cell lookup.
//!
//! A grid of dimension `d` is described by the number of cells along each axis and a uniform
//! step. The anchor of cell `(i_0, …, i_{d-1})` is `((i_0 + 1) * step, …, (i_{d-1} + 1) * step)`,
//! so the axes are strictly increasing and uniformly spaced starting one step away from the
//! origin.
//!
//! Lookup is performed independently per dimension: the sorted axis values are binary searched
//! for the first value greater than or equal to the query, the insertion point is clipped into
//! the axis, and interior points are resolved to whichever neighbouring anchor is closer. A
//! coordinate exactly halfway between two anchors resolves to the **lower** index.

use std::fmt::{self, Display};

use nalgebra::storage::Storage;
use nalgebra::{DMatrix, DVector, Dyn, Matrix, U1};

use crate::error::{Result, UwbError};

/// Index tuple identifying one cell of a [`Grid`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex(Vec<usize>);

impl CellIndex {
    pub fn new(indices: Vec<usize>) -> Self {
        CellIndex(indices)
    }
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl From<Vec<usize>> for CellIndex {
    fn from(indices: Vec<usize>) -> Self {
        CellIndex(indices)
    }
}
impl Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, ")")
    }
}

/// Uniformly spaced N-dimensional lattice of anchor positions
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    dims: Vec<usize>,
    step: f64,
    axes: Vec<DVector<f64>>,
}
impl Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Grid: {:?} cells | step: {} | {} dimensions",
            self.dims,
            self.step,
            self.dims.len()
        )
    }
}
impl Grid {
    /// Create a new grid from the per-dimension cell counts and the spacing between anchors.
    ///
    /// # Arguments
    /// - `dims` - number of cells along each axis, each at least one
    /// - `step` - spacing between neighbouring anchors, strictly positive and finite
    ///
    /// # Example
    /// ```rust
    /// use uwb::grid::Grid;
    /// let grid = Grid::new(vec![2, 4, 6], 10.0).unwrap();
    /// assert_eq!(grid.num_cells(), 48);
    /// assert_eq!(grid.axis(1).as_slice(), &[10.0, 20.0, 30.0, 40.0]);
    /// ```
    pub fn new(dims: Vec<usize>, step: f64) -> Result<Self> {
        if dims.is_empty() {
            return Err(UwbError::invalid("dims", "grid needs at least one dimension"));
        }
        if let Some(k) = dims.iter().position(|&n| n == 0) {
            return Err(UwbError::invalid(
                "dims",
                format!("axis {k} has zero cells"),
            ));
        }
        if !(step.is_finite() && step > 0.0) {
            return Err(UwbError::invalid("step", format!("must be positive, got {step}")));
        }
        let axes = dims
            .iter()
            .map(|&n| DVector::from_fn(n, |i, _| (i + 1) as f64 * step))
            .collect();
        Ok(Grid { dims, step, axes })
    }
    /// Number of cells along each axis
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
    /// Dimensionality of the coordinates the grid indexes
    pub fn dimension(&self) -> usize {
        self.dims.len()
    }
    pub fn step(&self) -> f64 {
        self.step
    }
    pub fn num_cells(&self) -> usize {
        self.dims.iter().product()
    }
    /// Sorted anchor values along axis `k`
    pub fn axis(&self, k: usize) -> &DVector<f64> {
        &self.axes[k]
    }
    /// Row-major flat position of `cell`, used to address per-cell storage arenas.
    pub fn flat_index(&self, cell: &CellIndex) -> Result<usize> {
        if cell.len() != self.dims.len() {
            return Err(UwbError::shape("cell index", self.dims.len(), cell.len()));
        }
        let mut flat = 0;
        for (k, (&i, &n)) in cell.as_slice().iter().zip(self.dims.iter()).enumerate() {
            if i >= n {
                return Err(UwbError::invalid(
                    "cell",
                    format!("index {i} out of range for axis {k} with {n} cells"),
                ));
            }
            flat = flat * n + i;
        }
        Ok(flat)
    }
    /// Inverse of [`Grid::flat_index`]
    pub fn cell_at(&self, flat: usize) -> CellIndex {
        let mut indices = vec![0; self.dims.len()];
        let mut rest = flat;
        for (k, &n) in self.dims.iter().enumerate().rev() {
            indices[k] = rest % n;
            rest /= n;
        }
        CellIndex(indices)
    }
    /// Every cell in row-major order
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        (0..self.num_cells()).map(|flat| self.cell_at(flat))
    }
    /// Anchor position of a cell. The index is assumed to be in range.
    pub fn anchor(&self, cell: &CellIndex) -> DVector<f64> {
        DVector::from_iterator(
            cell.len(),
            cell.as_slice().iter().map(|&i| (i + 1) as f64 * self.step),
        )
    }
    /// Lower and upper corners of the anchor bounding box
    pub fn bounds(&self) -> (DVector<f64>, DVector<f64>) {
        let lower = DVector::from_element(self.dims.len(), self.step);
        let upper = DVector::from_iterator(
            self.dims.len(),
            self.dims.iter().map(|&n| n as f64 * self.step),
        );
        (lower, upper)
    }
    /// Find the closest cell of a single coordinate.
    pub fn closest_cell_of<S>(&self, coordinate: &Matrix<f64, Dyn, U1, S>) -> Result<CellIndex>
    where
        S: Storage<f64, Dyn, U1>,
    {
        if coordinate.len() != self.dims.len() {
            return Err(UwbError::shape(
                "coordinate dimension",
                self.dims.len(),
                coordinate.len(),
            ));
        }
        let mut indices = Vec::with_capacity(self.dims.len());
        for (k, &x) in coordinate.iter().enumerate() {
            if !x.is_finite() {
                return Err(UwbError::invalid(
                    "coordinates",
                    format!("non-finite value {x} along axis {k}"),
                ));
            }
            indices.push(nearest_axis_index(self.axes[k].as_slice(), x));
        }
        Ok(CellIndex(indices))
    }
    /// Find the closest cells of a batch of coordinates.
    ///
    /// # Arguments
    /// - `coordinates` - `d × N` matrix, one coordinate per column
    ///
    /// # Returns
    /// - The `N` cell indices and a `d × N` matrix of the matching anchor positions
    pub fn closest_cell(&self, coordinates: &DMatrix<f64>) -> Result<(Vec<CellIndex>, DMatrix<f64>)> {
        if coordinates.nrows() != self.dims.len() {
            return Err(UwbError::shape(
                "coordinate dimension",
                self.dims.len(),
                coordinates.nrows(),
            ));
        }
        let mut cells = Vec::with_capacity(coordinates.ncols());
        let mut anchors = DMatrix::zeros(self.dims.len(), coordinates.ncols());
        for (j, column) in coordinates.column_iter().enumerate() {
            let cell = self.closest_cell_of(&column)?;
            anchors.set_column(j, &self.anchor(&cell));
            cells.push(cell);
        }
        Ok((cells, anchors))
    }
}

/// Nearest index on a sorted, non-empty axis. Ties resolve to the lower index.
fn nearest_axis_index(axis: &[f64], x: f64) -> usize {
    let insertion = axis.partition_point(|&v| v < x);
    if insertion == 0 {
        return 0;
    }
    if insertion >= axis.len() {
        return axis.len() - 1;
    }
    let lower = insertion - 1;
    if x - axis[lower] <= axis[insertion] - x {
        lower
    } else {
        insertion
    }
}
