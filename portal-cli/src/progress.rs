//! Terminal rendering of session events.

use indicatif::{ProgressBar, ProgressStyle};
use portal_transport::SessionEvent;
use tokio::sync::mpsc;

const BAR_TEMPLATE: &str = "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})";

fn bar_for(name: &str, size: u64) -> ProgressBar {
    let bar = ProgressBar::new(size);
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar.set_message(name.to_string());
    bar
}

/// Bytes represented by a progress fraction of `size`.
fn position(fraction: f64, size: u64) -> u64 {
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
    (fraction * size as f64).round() as u64
}

/// Draw events until the session reports `Done` or `Error`.
pub async fn render(mut events: mpsc::Receiver<SessionEvent>) {
    let mut bar: Option<(ProgressBar, u64)> = None;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Ready => log::debug!("registered with rendezvous server"),
            SessionEvent::Password(password) => {
                println!("Password: {}", password);
                println!("On the other computer run:\n\n    portal receive {}\n", password);
            }
            SessionEvent::FileInfo { name, size } => {
                bar = Some((bar_for(&name, size), size));
            }
            SessionEvent::Connected(kind) => log::info!("connected ({})", kind),
            SessionEvent::Progress(fraction) => {
                if let Some((bar, size)) = &bar {
                    bar.set_position(position(fraction, *size));
                }
            }
            SessionEvent::Done => {
                if let Some((bar, _)) = &bar {
                    bar.finish();
                }
                break;
            }
            SessionEvent::Error(_) => {
                if let Some((bar, _)) = &bar {
                    bar.abandon();
                }
                break;
            }
        }
    }
}
