/// This is a general example of how you would typically feed a list-mode
/// file through the coincidence engine: decode, scan into a fused
/// histogram, and hand the bins to whatever does the exponential fit.
use anyhow::{Context, Result};
use rossi::{scan, CoincidenceConfig, CoincidenceMethod, Histogram};

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: rossi_alpha <file.lmx>")?;

    // ===========================================
    // These are most likely your free parameters:
    let reset_time = 2000.0;
    let bins = 200;
    let method = CoincidenceMethod::AnyAndAll;
    // ===========================================

    let lmx = rossi::lmx::decode(&path).with_context(|| format!("failed to decode `{path}`"))?;
    eprintln!(
        "{} events, tick length {} {}",
        lmx.events.len(),
        lmx.header.tick_length.value,
        lmx.header.tick_length.unit.as_deref().unwrap_or(""),
    );
    if let Some(final_time) = lmx.final_time {
        eprintln!("measurement ended at {final_time}");
    }

    let config = CoincidenceConfig::builder()
        .reset_time(reset_time)
        .method(method)
        .build();
    let mut histogram = Histogram::new(bins, 0.0, reset_time);
    scan(&lmx.events, &config, &mut histogram)?;

    for (center, count) in histogram.bin_centers().zip(histogram.counts()) {
        println!("{center}\t{count}");
    }

    Ok(())
}
