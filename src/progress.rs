use indicatif::{ProgressBar, ProgressStyle};

use crate::transfer::ProgressSink;

const TEMPLATE: &str =
    "{msg:30}  {binary_bytes_per_sec:>12}  {bytes:>9} / {total_bytes:<9} {elapsed:>4} [{bar:40}] {percent:>3}%";

/// Progress bar for streaming a resource of `size` bytes. Draws to stderr and
/// stays hidden when stderr is not a terminal.
pub fn transfer_bar(name: &str, size: u64) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("## "),
    );
    bar.set_message(name.to_string());
    bar
}

impl ProgressSink for ProgressBar {
    fn advance(&mut self, bytes: u64) {
        self.inc(bytes);
    }

    fn finish(&mut self) {
        ProgressBar::finish(self);
    }

    fn abandon(&mut self) {
        ProgressBar::abandon(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_tracks_streamed_bytes() {
        let mut bar = transfer_bar("a.txt", 2048);
        bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        bar.advance(1024);
        bar.advance(1024);
        assert_eq!(bar.position(), 2048);
        assert_eq!(bar.length(), Some(2048));

        ProgressSink::finish(&mut bar);
        assert!(bar.is_finished());
    }
}
