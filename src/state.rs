//! Thermodynamic states and the energy functions that define them.

use crate::errors::*;
use crate::trajectory::{Frame, Trajectory};
use ndarray::Array1;
use rayon::prelude::*;
use std::fmt;

/// Molar gas constant in kJ/(mol·K)
pub const MOLAR_GAS_CONSTANT: f64 = 8.314e-3;

/// Something that can compute the potential energy of a frame
///
/// Implementations must be pure: the energy of a frame may only depend on the frame and on the
/// evaluator's own parameters. Frames are evaluated in parallel.
///
/// Any `Fn(&F) -> f64 + Send + Sync` closure is an evaluator.
pub trait EnergyEvaluator<F = Frame>: Send + Sync {
    /// Potential energy of `frame` in kJ/mol
    fn energy(&self, frame: &F) -> f64;
}

impl<F, T> EnergyEvaluator<F> for T
where
    T: Fn(&F) -> f64 + Send + Sync,
{
    fn energy(&self, frame: &F) -> f64 {
        self(frame)
    }
}

/// A thermodynamic state: a temperature and a potential energy function
pub struct State<F = Frame> {
    name: String,
    temperature: f64,
    evaluator: Box<dyn EnergyEvaluator<F>>,
    generation: u64,
}

impl<F> State<F> {
    /// Create a state named `name` at `temperature` (in K)
    pub fn new<E>(name: impl Into<String>, temperature: f64, evaluator: E) -> Result<Self>
    where
        E: EnergyEvaluator<F> + 'static,
    {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(MBarError::InvalidTemperature(temperature));
        }

        Ok(Self {
            name: name.into(),
            temperature,
            evaluator: Box::new(evaluator),
            generation: 0,
        })
    }

    /// Name of the state; unique within an estimator
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Temperature in K
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Inverse thermal energy $\beta = 1/(RT)$ in mol/kJ
    pub fn beta(&self) -> f64 {
        1.0 / (MOLAR_GAS_CONSTANT * self.temperature)
    }

    /// Insertion counter assigned by the estimator that owns this state
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Reduced potential energy $\beta U$ of a single frame
    pub fn reduced_energy(&self, frame: &F) -> f64 {
        self.evaluator.energy(frame) * self.beta()
    }
}

impl<F: Sync> State<F> {
    /// Reduced potential energy $\beta U$ of every frame of `trajectory`, in order
    pub fn evaluate_trajectory(&self, trajectory: &Trajectory<F>) -> Array1<f64> {
        let beta = self.beta();
        let energies: Vec<f64> = trajectory
            .frames()
            .par_iter()
            .map(|frame| self.evaluator.energy(frame) * beta)
            .collect();
        Array1::from(energies)
    }
}

impl<F> fmt::Debug for State<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("temperature", &self.temperature)
            .field("generation", &self.generation)
            .finish()
    }
}
