use num_complex::Complex64;
use num_traits::Zero;
use std::fmt;
use std::ops::{Index, IndexMut};

#[macro_export]
macro_rules! cmplx {
    () => {
        num_complex::Complex64::new(0.0, 0.0)
    };
    ($arg1:expr) => {
        num_complex::Complex64::new($arg1, 0.0)
    };
    ($arg1:expr, $arg2:expr) => {
        num_complex::Complex64::new($arg1, $arg2)
    };
}

/// Builds a phasor from a magnitude and an angle in degrees.
pub fn polar_deg(magnitude: f64, degrees: f64) -> Complex64 {
    Complex64::from_polar(magnitude, degrees.to_radians())
}

/// Unit phasor along `z`, or `None` when `z` has no usable direction.
pub fn unit(z: Complex64) -> Option<Complex64> {
    let m = z.norm();
    if m.is_finite() && m > f64::EPSILON {
        Some(z / m)
    } else {
        None
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub enum Phase {
    A = 0,
    B = 1,
    C = 2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    /// Nominal angle of the phase-to-neutral voltage (direct sequence).
    pub fn angle_deg(self) -> f64 {
        match self {
            Phase::A => 0.0,
            Phase::B => -120.0,
            Phase::C => 120.0,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
        };
        write!(f, "{}", s)
    }
}

/// Exactly one value per phase.
#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct PerPhase<T>(pub [T; 3]);

impl<T: Copy> PerPhase<T> {
    pub fn new(a: T, b: T, c: T) -> Self {
        PerPhase([a, b, c])
    }

    pub fn splat(v: T) -> Self {
        PerPhase([v, v, v])
    }

    pub fn from_fn(mut f: impl FnMut(Phase) -> T) -> Self {
        PerPhase([f(Phase::A), f(Phase::B), f(Phase::C)])
    }

    pub fn map<U: Copy>(&self, mut f: impl FnMut(T) -> U) -> PerPhase<U> {
        PerPhase([f(self.0[0]), f(self.0[1]), f(self.0[2])])
    }

    pub fn zip<U: Copy, V: Copy>(
        &self,
        other: &PerPhase<U>,
        mut f: impl FnMut(T, U) -> V,
    ) -> PerPhase<V> {
        PerPhase::from_fn(|p| f(self[p], other[p]))
    }

    /// Iterates `(phase, value)` pairs in phase order.
    pub fn iter(&self) -> impl Iterator<Item = (Phase, T)> + '_ {
        Phase::ALL.iter().map(move |&p| (p, self[p]))
    }
}

impl<T: Copy + Zero> PerPhase<T> {
    pub fn zero() -> Self {
        PerPhase([T::zero(), T::zero(), T::zero()])
    }

    pub fn sum(&self) -> T {
        self.0[0] + self.0[1] + self.0[2]
    }
}

impl PerPhase<f64> {
    pub fn max(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn mean(&self) -> f64 {
        self.sum() / 3.0
    }

    /// Difference between the highest and the lowest phase.
    pub fn spread(&self) -> f64 {
        self.max() - self.min()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl PerPhase<Complex64> {
    /// Balanced direct-sequence phasors of the given magnitude.
    pub fn balanced(magnitude: f64) -> Self {
        PerPhase::from_fn(|p| polar_deg(magnitude, p.angle_deg()))
    }

    pub fn norm(&self) -> PerPhase<f64> {
        self.map(|z| z.norm())
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|z| z.re.is_finite() && z.im.is_finite())
    }
}

impl<T> Index<Phase> for PerPhase<T> {
    type Output = T;

    fn index(&self, p: Phase) -> &T {
        &self.0[p.index()]
    }
}

impl<T> IndexMut<Phase> for PerPhase<T> {
    fn index_mut(&mut self, p: Phase) -> &mut T {
        &mut self.0[p.index()]
    }
}
