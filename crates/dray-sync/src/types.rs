use dray_types::ImageId;
use serde::{Deserialize, Serialize};

/// Outcome of one executor run that finished without a failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub completed: usize,
    /// Jobs that observed cancellation before they started.
    pub cancelled: usize,
    pub bytes: u64,
}

impl TransferReport {
    pub fn absorb(&mut self, other: &TransferReport) {
        self.completed += other.completed;
        self.cancelled += other.cancelled;
        self.bytes += other.bytes;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Per-image download counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePull {
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    /// The image the reference resolved to.
    pub id: Option<ImageId>,
    /// Images fetched, child first.
    pub images: Vec<ImageId>,
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes: u64,
}

impl PullReport {
    pub fn record(&mut self, id: ImageId, pull: &ImagePull) {
        self.images.push(id);
        self.downloaded += pull.downloaded;
        self.skipped += pull.skipped;
        self.bytes += pull.bytes;
    }
}

/// Whether an image walk should go on to the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_default_to_zero() {
        assert_eq!(PushReport::default().uploaded, 0);
        assert!(PullReport::default().images.is_empty());
    }

    #[test]
    fn pull_report_accumulates() {
        let mut report = PullReport::default();
        let a = ImagePull { downloaded: 2, skipped: 1, bytes: 10 };
        let b = ImagePull { downloaded: 0, skipped: 3, bytes: 0 };
        report.record(ImageId::new("a").unwrap(), &a);
        report.record(ImageId::new("b").unwrap(), &b);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.skipped, 4);
        assert_eq!(report.images.len(), 2);
    }

    #[test]
    fn transfer_reports_absorb() {
        let mut total = TransferReport::default();
        total.absorb(&TransferReport { completed: 2, cancelled: 0, bytes: 7 });
        total.absorb(&TransferReport { completed: 1, cancelled: 1, bytes: 3 });
        assert_eq!(total, TransferReport { completed: 3, cancelled: 1, bytes: 10 });
    }
}
