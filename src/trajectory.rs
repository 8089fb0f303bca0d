//! Ordered sequences of configurations handed to the estimator by the simulation engine.

use std::ops::Index;

/// A single configuration of the simulated system
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Atomic positions in nm
    pub positions: Vec<[f64; 3]>,
    /// Periodic box vectors in nm, if the system is periodic
    pub periodic_box: Option<[[f64; 3]; 3]>,
}

impl Frame {
    /// A non-periodic frame
    pub fn new(positions: Vec<[f64; 3]>) -> Self {
        Self {
            positions,
            periodic_box: None,
        }
    }

    /// A frame in a periodic box
    pub fn with_box(positions: Vec<[f64; 3]>, periodic_box: [[f64; 3]; 3]) -> Self {
        Self {
            positions,
            periodic_box: Some(periodic_box),
        }
    }

    /// Number of atoms in the frame
    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }
}

/// An ordered, indexable sequence of frames
///
/// `F` is usually [`Frame`], but any configuration type works as long as the energy evaluators
/// of the states understand it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory<F = Frame> {
    frames: Vec<F>,
}

impl<F> Trajectory<F> {
    /// Wrap a vector of frames
    pub fn new(frames: Vec<F>) -> Self {
        Self { frames }
    }

    /// Number of frames in the trajectory
    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    /// Whether the trajectory has no frames at all
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frames in order
    pub fn frames(&self) -> &[F] {
        &self.frames
    }

    /// Iterate over the frames in order
    pub fn iter(&self) -> std::slice::Iter<'_, F> {
        self.frames.iter()
    }
}

impl<F: Clone> Trajectory<F> {
    /// Concatenate trajectories, preserving the order of both the trajectories and their frames
    pub fn join<'a, I>(trajectories: I) -> Self
    where
        I: IntoIterator<Item = &'a Trajectory<F>>,
        F: 'a,
    {
        let frames = trajectories
            .into_iter()
            .flat_map(|traj| traj.frames.iter().cloned())
            .collect();
        Self { frames }
    }
}

impl<F> From<Vec<F>> for Trajectory<F> {
    fn from(frames: Vec<F>) -> Self {
        Self::new(frames)
    }
}

impl<F> std::iter::FromIterator<F> for Trajectory<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<F> Index<usize> for Trajectory<F> {
    type Output = F;

    fn index(&self, index: usize) -> &F {
        &self.frames[index]
    }
}

impl<'a, F> IntoIterator for &'a Trajectory<F> {
    type Item = &'a F;
    type IntoIter = std::slice::Iter<'a, F>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_preserves_order() {
        let a: Trajectory<f64> = vec![1.0, 2.0].into();
        let b: Trajectory<f64> = vec![3.0].into();
        let empty: Trajectory<f64> = Trajectory::new(vec![]);

        let joined = Trajectory::join(vec![&a, &empty, &b]);

        assert_eq!(joined.n_frames(), 3);
        assert_eq!(joined.frames(), &[1.0, 2.0, 3.0]);
        assert_eq!(joined[2], 3.0);
    }

    #[test]
    fn frame_box() {
        let frame = Frame::with_box(
            vec![[0.0, 0.0, 0.0], [0.1, 0.0, 0.0]],
            [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]],
        );
        assert_eq!(frame.n_atoms(), 2);
        assert!(frame.periodic_box.is_some());
        assert!(Frame::new(vec![]).periodic_box.is_none());
    }
}
