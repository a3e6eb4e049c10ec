use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use fetchtastic_dl::types::DownloadState;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressState, ProgressStyle};

fn create_progress_bar(filename: &str) -> ProgressBar {
    let progress_bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{prefix:32} [{wide_bar:.green/white}] {bytes_per_sec:14} {computed_bytes:22}",
    )
    .unwrap()
    .with_key("computed_bytes", format_bytes)
    .progress_chars("━━");
    progress_bar.set_style(style);
    progress_bar.set_prefix(filename.to_string());
    progress_bar
}

fn format_bytes(state: &ProgressState, w: &mut dyn std::fmt::Write) {
    write!(
        w,
        "{}/{}",
        HumanBytes(state.pos()),
        HumanBytes(state.len().unwrap_or(state.pos()))
    )
    .unwrap();
}

/// Renders one bar per in-flight file under a shared MultiProgress. Returns
/// the callback handed to the download engine.
pub fn progress_callback(
    multi: Arc<MultiProgress>,
) -> Arc<dyn Fn(DownloadState) + Send + Sync> {
    let bars: Arc<Mutex<HashMap<String, ProgressBar>>> = Arc::new(Mutex::new(HashMap::new()));

    Arc::new(move |state| {
        let mut bars = bars.lock().unwrap();
        match state {
            DownloadState::Preparing { filename, total } => {
                let bar = multi.add(create_progress_bar(&filename));
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bars.insert(filename, bar);
            }
            DownloadState::Progress {
                filename,
                downloaded,
                total,
            } => {
                if let Some(bar) = bars.get(&filename) {
                    if let Some(total) = total {
                        bar.set_length(total);
                    }
                    bar.set_position(downloaded);
                }
            }
            DownloadState::Complete { filename } => {
                if let Some(bar) = bars.remove(&filename) {
                    bar.finish_and_clear();
                }
            }
            DownloadState::Error | DownloadState::Recovered => {}
        }
    })
}
