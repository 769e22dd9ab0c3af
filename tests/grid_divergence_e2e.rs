use gridwass::{sinkhorn_divergence, DivergenceConfig};
use ndarray::{array, Array2};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `|value - expected| <= max(5% relative, 1e-2 absolute)`.
fn assert_close(value: f64, expected: f64) {
    let tol = (0.05 * value.abs().max(expected.abs())).max(1e-2);
    assert!(
        (value - expected).abs() <= tol,
        "value={} expected={}",
        value,
        expected
    );
}

fn div(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    sinkhorn_divergence(a, b, &DivergenceConfig::default()).unwrap()
}

#[test]
fn same_image_is_free() {
    init();
    let g = array![[1.0, 1.0], [1.0, 1.0]];
    assert_close(div(&g, &g), 0.0);
}

#[test]
fn one_bin_moves_across_the_diagonal() {
    init();
    let a = array![[1.0, 0.0], [0.0, 0.0]];
    let b = array![[0.0, 0.0], [0.0, 1.0]];
    assert_close(div(&a, &b), 2.0f64.sqrt());
}

#[test]
fn one_bin_on_a_rectangle() {
    init();
    let a = array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
    let b = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    assert_close(div(&a, &b), 5.0f64.sqrt());
}

#[test]
fn two_bins_shift_one_column() {
    init();
    let a = array![[1.0, 0.0], [1.0, 0.0]];
    let b = array![[0.0, 1.0], [0.0, 1.0]];
    assert_close(div(&a, &b), 2.0);

    let a = array![[1.0, 0.0], [0.0, 1.0]];
    let b = array![[0.0, 1.0], [1.0, 0.0]];
    assert_close(div(&a, &b), 2.0);
}

#[test]
fn overlapping_bin_stays_put() {
    init();
    let a = array![[1.0, 1.0], [0.0, 0.0]];
    let b = array![[0.0, 1.0], [0.0, 1.0]];
    assert_close(div(&a, &b), 2.0f64.sqrt());
}

#[test]
fn two_bins_merge_into_one_and_back() {
    init();
    let a = array![[1.0, 1.0], [0.0, 0.0]];
    let b = array![[0.0, 0.0], [0.0, 2.0]];
    let expected = 1.0 + 2.0f64.sqrt();
    assert_close(div(&a, &b), expected);
    assert_close(div(&b, &a), expected);
}

#[test]
fn column_collapses_into_two_cells() {
    init();
    let a = array![
        [0.0, 0.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, 1.0]
    ];
    let b = array![
        [0.0, 0.0, 0.0, 0.0],
        [2.0, 0.0, 0.0, 0.0],
        [2.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0]
    ];
    assert_close(div(&a, &b), 2.0 * (3.0 + 10.0f64.sqrt()));
}

#[test]
fn small_checkerboard_swaps_colors() {
    init();
    let a = Array2::from_shape_fn((4, 4), |(i, j)| ((i + j) % 2) as f64);
    let b = Array2::from_shape_fn((4, 4), |(i, j)| ((i + j + 1) % 2) as f64);
    assert_close(div(&a, &b), 8.0);
}

#[test]
fn single_mass_crosses_a_large_grid() {
    init();
    let n = 64;
    let mut a = Array2::<f64>::zeros((n, n));
    let mut b = Array2::<f64>::zeros((n, n));
    a[[0, 0]] = 1.0;
    b[[n - 1, n - 1]] = 1.0;
    assert_close(div(&a, &b), 2.0f64.sqrt() * (n - 1) as f64);
}

#[test]
fn two_corners_merge_on_a_large_grid() {
    init();
    let n = 64;
    let mut a = Array2::<f64>::zeros((n, n));
    let mut b = Array2::<f64>::zeros((n, n));
    a[[n - 1, 0]] = 1.0;
    a[[0, n - 1]] = 1.0;
    b[[n - 1, n - 1]] = 2.0;
    assert_close(div(&a, &b), 2.0 * (n - 1) as f64);
}

#[test]
fn large_checkerboard_swaps_colors() {
    init();
    let n = 64;
    let a = Array2::from_shape_fn((n, n), |(i, j)| ((i + j) % 2) as f64);
    let b = Array2::from_shape_fn((n, n), |(i, j)| ((i + j + 1) % 2) as f64);
    assert_close(div(&a, &b), (n * n) as f64 / 2.0);
}

#[test]
fn squared_cost_reports_squared_distance() {
    init();
    let a = array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
    let b = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    let config = DivergenceConfig::default().with_p(2.0).with_blur(0.05);
    let d = sinkhorn_divergence(&a, &b, &config).unwrap();
    assert_close(d, 5.0);
}
