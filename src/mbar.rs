//! MBAR solved by pymbar through an embedded Python interpreter.
//!
//! Requires the `pymbar` feature and a Python environment with pymbar installed.

use crate::errors::*;
use crate::solver::{
    check_counts, InitialFreeEnergies, Solution, Solver, DEFAULT_MAXIMUM_ITERATIONS,
    DEFAULT_RELATIVE_TOLERANCE,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use numpy::{PyArray, PyArray1, PyArray2};
use pyo3::prelude::*;
use pyo3::types::PyDict;

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// The first `n_k[0]` snapshots are from the first state, the next `n_k[1]` from the second,
    /// and so forth. This only matters for BAR initialization.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "DEFAULT_MAXIMUM_ITERATIONS")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "DEFAULT_RELATIVE_TOLERANCE")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// Pointer to the MBAR object on Python's heap
    ///
    /// After Self is built, this should always be a valid pointer to an MBAR object. This is
    /// enforced by it being a private field and MBar structs only being constructable via the
    /// builder pattern.
    #[builder(setter(skip), default = "Python::with_gil(|py| py.None())")]
    mbar_obj: PyObject,
}

impl MBarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            check_counts(u_kn.view(), n_k.view()).map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    /// Build and initialise the MBAR implementation
    pub fn build(&self) -> Result<MBar> {
        self.build_inner()?.init()
    }
}

impl MBar {
    /// Initialise the MBAR in Python; called by build methods
    fn init(mut self) -> Result<Self> {
        Python::with_gil(|py| {
            let mbar = py.import("pymbar")?.get("MBAR")?;
            let kwargs: &PyDict = PyDict::new(py);
            kwargs.set_item("u_kn", PyArray::from_array(py, &self.u_kn))?;
            kwargs.set_item(
                "N_k",
                PyArray::from_exact_iter(py, self.n_k.iter().copied()),
            )?;
            kwargs.set_item("maximum_iterations", self.maximum_iterations)?;
            kwargs.set_item("relative_tolerance", self.relative_tolerance)?;
            kwargs.set_item("verbose", false)?;

            match &self.initial_free_energies {
                InitialFreeEnergies::Specified(energies) => {
                    if energies.len() != self.k() {
                        return Err(MBarError::ArrayLengthMismatch(energies.len(), self.k()));
                    }
                    let energies_py = PyArray::from_exact_iter(py, energies.iter().copied());
                    kwargs.set_item("initial_f_k", energies_py)?;
                }
                InitialFreeEnergies::Zeros => {
                    kwargs.set_item("initialize", "zeros")?;
                }
                InitialFreeEnergies::BAR => {
                    kwargs.set_item("initialize", "BAR")?;
                }
            }

            self.mbar_obj = PyAny::call(mbar, (), Some(kwargs))?.to_object(py);
            log::debug!("pymbar solved {} states", self.k());
            Ok(self)
        })
    }

    /// Get a new builder for the `MBar` struct. `MBar` can only be constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// Retrieve a copy of the relative dimensionless free energy $f_k$ of states $k$
    pub fn f_k(&self) -> Result<Array1<f64>> {
        Python::with_gil(|py| {
            Ok(self
                .mbar_obj
                .as_ref(py)
                .getattr("f_k")?
                .extract::<&PyArray1<f64>>()?
                .to_owned_array())
        })
    }

    /// Retrieve a copy of the weight matrix $W_{nk}$
    ///
    /// Note the frame-major layout, the transpose of [`Solution::w_kn`].
    pub fn w_nk(&self) -> Result<Array2<f64>> {
        Python::with_gil(|py| {
            Ok(self
                .mbar_obj
                .as_ref(py)
                .call_method0("W_nk")?
                .extract::<&PyArray2<f64>>()?
                .to_owned_array())
        })
    }
}

/// A [`Solver`] that hands the MBAR equations to pymbar
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(name = "build_inner", private))]
pub struct PyMbarSolver {
    /// Set to limit the maximum number of iterations performed
    #[builder(default = "DEFAULT_MAXIMUM_ITERATIONS")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "DEFAULT_RELATIVE_TOLERANCE")]
    relative_tolerance: f64,
}

impl PyMbarSolverBuilder {
    /// Build the solver
    pub fn build(&self) -> Result<PyMbarSolver> {
        Ok(self.build_inner()?)
    }
}

impl PyMbarSolver {
    /// Get a new builder for the `PyMbarSolver` struct.
    pub fn builder() -> PyMbarSolverBuilder {
        PyMbarSolverBuilder::default()
    }
}

impl Default for PyMbarSolver {
    fn default() -> Self {
        Self {
            maximum_iterations: DEFAULT_MAXIMUM_ITERATIONS,
            relative_tolerance: DEFAULT_RELATIVE_TOLERANCE,
        }
    }
}

impl Solver for PyMbarSolver {
    fn solve(
        &self,
        u_kn: ArrayView2<'_, f64>,
        n_k: ArrayView1<'_, usize>,
        initialize: &InitialFreeEnergies,
    ) -> Result<Solution> {
        check_counts(u_kn, n_k)?;

        let mbar = MBar::builder()
            .u_kn(u_kn.to_owned())
            .n_k(n_k.to_owned())
            .maximum_iterations(self.maximum_iterations)
            .relative_tolerance(self.relative_tolerance)
            .initial_free_energies(initialize.clone())
            .build()?;

        Ok(Solution {
            f_k: mbar.f_k()?,
            w_kn: mbar.w_nk()?.reversed_axes(),
            n_k: n_k.to_owned(),
        })
    }
}
