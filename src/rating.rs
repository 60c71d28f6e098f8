//! Rating predictions for challenge outcomes.
//!
//! The model is an expected-score curve: the further the problem sits above a
//! participant's rating, the bigger the swing in both directions. Longer
//! challenges scale the swing down, since more time means a higher expected
//! chance of solving.

/// Predicted rating deltas for a participant attempting a problem.
///
/// Returns `(lose_delta, win_delta)` with `lose_delta <= 0 <= win_delta`.
/// Total for all inputs and always finite.
pub fn predict(rating: i64, problem_rating: i64, length_minutes: u32) -> (i64, i64) {
    let diff = (problem_rating - rating) as f64;
    // Expected probability of solving within the window.
    let expected = 1.0 / (1.0 + 10f64.powf(diff / 400.0));
    let scale = 2400.0 / (length_minutes as f64 + 20.0);
    let swing = scale * (1.0 - expected);

    let win = swing.round() as i64;
    let lose = -((0.8 * swing).round() as i64);
    (lose, win)
}
