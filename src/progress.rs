use indicatif::{ProgressBar, ProgressStyle};

/// Create a progress bar for a streaming pass over marker batches.
///
/// Returns a visible bar when `show` is true, or a hidden no-op bar otherwise.
/// The bar is written to stderr and uses a compact format:
///   `  label [=====>     ] 42/100 batches (12.3 batches/s, ETA 5s)`
pub fn make_progress_bar(n_batches: u64, label: &str, show: bool) -> ProgressBar {
    if !show || n_batches == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(n_batches);
    pb.set_style(
        ProgressStyle::with_template(
            "  {msg} [{bar:30}] {pos}/{len} batches ({per_sec}, ETA {eta})",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    pb.set_message(label.to_string());
    pb
}
