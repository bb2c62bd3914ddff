//! Enumeration and evaluation of the monomials that make up the squared
//! amplitude as a polynomial in the theory parameters.

use crate::error::ConfigurationError;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Enumerates every exponent vector `e` with `e_k <= max_powers[k]` and
/// `sum(e) <= max_overall_power`.
///
/// Rows are ordered by total degree, and within a degree by descending
/// lexicographic order of the exponents. For two parameters and power 2 this
/// gives `1, t1, t2, t1^2, t1 t2, t2^2`.
pub fn find_components(
    max_powers: &[u32],
    max_overall_power: u32,
) -> Result<Array2<u32>, ConfigurationError> {
    if max_powers.is_empty() {
        return Err(ConfigurationError::NoParameters);
    }
    if max_overall_power == 0 {
        return Err(ConfigurationError::InvalidOptions(
            "max_overall_power must be at least 1".to_string(),
        ));
    }

    let mut exponents: Vec<Vec<u32>> = max_powers
        .iter()
        .map(|&p| 0..=p)
        .multi_cartesian_product()
        .filter(|e| e.iter().sum::<u32>() <= max_overall_power)
        .collect();
    exponents.sort_by(|a, b| {
        let degree_a: u32 = a.iter().sum();
        let degree_b: u32 = b.iter().sum();
        degree_a.cmp(&degree_b).then_with(|| b.cmp(a))
    });

    let n_parameters = max_powers.len();
    let flat: Vec<u32> = exponents.into_iter().flatten().collect();
    let n_components = flat.len() / n_parameters;
    Array2::from_shape_vec((n_components, n_parameters), flat).map_err(|e| {
        ConfigurationError::InvalidOptions(format!("component enumeration failed: {e}"))
    })
}

/// Evaluates every component monomial at `theta`.
pub fn evaluate_components(components: ArrayView2<u32>, theta: ArrayView1<f64>) -> Array1<f64> {
    components
        .rows()
        .into_iter()
        .map(|exponents| monomial(exponents, theta))
        .collect()
}

/// Partial derivatives of every component at `theta`, shape `(n_parameters, n_components)`.
pub fn evaluate_component_gradients(
    components: ArrayView2<u32>,
    theta: ArrayView1<f64>,
) -> Array2<f64> {
    let n_parameters = components.ncols();
    let mut gradients = Array2::zeros((n_parameters, components.nrows()));
    for (j, exponents) in components.rows().into_iter().enumerate() {
        for k in 0..n_parameters {
            let e_k = exponents[k];
            if e_k == 0 {
                continue;
            }
            let rest: f64 = exponents
                .iter()
                .zip(theta.iter())
                .enumerate()
                .map(|(m, (&e, &t))| if m == k { t.powi(e as i32 - 1) } else { t.powi(e as i32) })
                .product();
            gradients[[k, j]] = f64::from(e_k) * rest;
        }
    }
    gradients
}

/// The morphing matrix: row `i` holds all components evaluated at `points[i]`.
pub fn monomial_matrix(components: ArrayView2<u32>, points: ArrayView2<f64>) -> Array2<f64> {
    Array2::from_shape_fn((points.nrows(), components.nrows()), |(i, j)| {
        monomial(components.row(j), points.row(i))
    })
}

/// Renders a component as text, e.g. `cwl2^2 cpwl2` or `1`.
pub fn describe_component(exponents: ArrayView1<u32>, names: &[String]) -> String {
    let factors: Vec<String> = exponents
        .iter()
        .zip(names)
        .filter(|(e, _)| **e > 0)
        .map(|(&e, name)| if e == 1 { name.clone() } else { format!("{name}^{e}") })
        .collect();
    if factors.is_empty() {
        "1".to_string()
    } else {
        factors.join(" ")
    }
}

fn monomial(exponents: ArrayView1<u32>, theta: ArrayView1<f64>) -> f64 {
    exponents
        .iter()
        .zip(theta.iter())
        .map(|(&e, &t)| t.powi(e as i32))
        .product()
}
