//! Fixed-step classical RK4 over the whole ensemble
//!
//! The state is an (n_particles, 6) array of `[x, v]` rows. The derivative
//! is supplied by the caller so the same recurrence drives every CPU-side
//! evaluation path.

use ndarray::{Array2, Array3, ArrayView2, Axis};

/// Advance `state` by one step of size `dt`:
/// k1 = f(s), k2 = f(s + dt/2 k1), k3 = f(s + dt/2 k2), k4 = f(s + dt k3)
/// s' = s + dt/6 (k1 + 2 k2 + 2 k3 + k4)
pub fn rk4_step<F>(state: ArrayView2<f64>, dt: f64, deriv: &mut F) -> Array2<f64>
where
    F: FnMut(ArrayView2<f64>) -> Array2<f64>,
{
    let half_dt = 0.5 * dt; // half step dt/2
    let sixth_dt = dt / 6.0; // weight of the combined slope

    let k1 = deriv(state);
    let k2 = deriv((&state + &(&k1 * half_dt)).view());
    let k3 = deriv((&state + &(&k2 * half_dt)).view());
    let k4 = deriv((&state + &(&k3 * dt)).view());

    // ((k1 + 2 k2) + 2 k3) + k4, left to right in every backend
    let slope = &k1 + &(&k2 * 2.0) + &(&k3 * 2.0) + &k4;
    &state + &(slope * sixth_dt)
}

/// Integrate `num_steps - 1` steps from `initial` and return the full history
/// shaped (num_steps, n_particles, 6). Row 0 is `initial`, untouched.
pub fn integrate<F>(initial: ArrayView2<f64>, num_steps: usize, dt: f64, mut deriv: F) -> Array3<f64>
where
    F: FnMut(ArrayView2<f64>) -> Array2<f64>,
{
    let (n, cols) = initial.dim();
    let mut history = Array3::zeros((num_steps, n, cols));
    history.index_axis_mut(Axis(0), 0).assign(&initial);

    for i in 1..num_steps {
        let next = rk4_step(history.index_axis(Axis(0), i - 1), dt, &mut deriv);
        history.index_axis_mut(Axis(0), i).assign(&next);
    }
    history
}
