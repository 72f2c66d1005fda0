//! Batch splitter: claims a pool of unarchived files, groups them and keeps
//! only groups large enough to be worth a bundle.

use crate::{
    errors::ArchiveResult,
    models::media_file::MediaFile,
    services::catalog::Catalog,
};
use std::collections::HashSet;
use uuid::Uuid;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One batch proposed by a [`GroupBySize`] implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeGroup {
    pub file_ids: Vec<Uuid>,
    pub total_size_gb: f64,
}

/// Partitions a file set into batches. Implementations may drop files; any
/// file not placed in a returned group goes back to the pool.
pub trait GroupBySize: Send + Sync {
    fn group(&self, files: &[MediaFile]) -> Vec<SizeGroup>;
}

/// Fills batches in recording order, starting a new one whenever the next
/// file would push the current batch past `max_group_gb`.
#[derive(Debug, Clone)]
pub struct SequentialGrouper {
    pub max_group_gb: f64,
}

impl GroupBySize for SequentialGrouper {
    fn group(&self, files: &[MediaFile]) -> Vec<SizeGroup> {
        let mut sorted: Vec<&MediaFile> = files.iter().collect();
        sorted.sort_by(|a, b| {
            a.recording_dt
                .cmp(&b.recording_dt)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });

        let mut groups = Vec::new();
        let mut current = SizeGroup {
            file_ids: Vec::new(),
            total_size_gb: 0.0,
        };
        for file in sorted {
            let size_gb = file.size_bytes as f64 / BYTES_PER_GB;
            if !current.file_ids.is_empty() && current.total_size_gb + size_gb > self.max_group_gb {
                groups.push(std::mem::replace(
                    &mut current,
                    SizeGroup {
                        file_ids: Vec::new(),
                        total_size_gb: 0.0,
                    },
                ));
            }
            current.file_ids.push(file.id);
            current.total_size_gb += size_gb;
        }
        if !current.file_ids.is_empty() {
            groups.push(current);
        }
        groups
    }
}

pub struct Splitter<'a> {
    pub catalog: &'a Catalog,
    pub grouper: &'a dyn GroupBySize,
    pub min_archive_size_gb: f64,
}

impl Splitter<'_> {
    /// Claim, group and filter the pool for one (project, device type) pair.
    ///
    /// Every returned batch totals at least `min_archive_size_gb`; its files
    /// stay claimed for the packer. All other claimed files are released.
    pub async fn split(&self, project_id: &str, device_type: &str) -> ArchiveResult<Vec<SizeGroup>> {
        let claim_id = Uuid::new_v4();
        let claimed = self
            .catalog
            .claim_unassigned(project_id, device_type, claim_id)
            .await?;
        if claimed == 0 {
            tracing::debug!(project_id, device_type, "no unassigned files");
            return Ok(Vec::new());
        }

        let files = self.catalog.files_by_claim(claim_id).await?;
        let groups = self.grouper.group(&files);

        let (qualified, undersized): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .partition(|g| g.total_size_gb >= self.min_archive_size_gb);

        let kept: HashSet<Uuid> = qualified
            .iter()
            .flat_map(|g| g.file_ids.iter().copied())
            .collect();
        let released: Vec<Uuid> = files
            .iter()
            .map(|f| f.id)
            .filter(|id| !kept.contains(id))
            .collect();
        self.catalog.release_files(&released).await?;

        for group in &undersized {
            tracing::info!(
                project_id,
                device_type,
                files = group.file_ids.len(),
                size_gb = group.total_size_gb,
                min_gb = self.min_archive_size_gb,
                "batch below minimum archive size, files released"
            );
        }
        tracing::info!(
            project_id,
            device_type,
            claimed,
            batches = qualified.len(),
            released = released.len(),
            "split complete"
        );
        Ok(qualified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::media_file::ArchiveStatus;
    use chrono::{TimeZone, Utc};

    fn file(day: u32, gb: f64) -> MediaFile {
        MediaFile {
            id: Uuid::new_v4(),
            project_id: "ABC".into(),
            device_type: "Camera".into(),
            deployment_id: None,
            name: format!("{day}.jpg"),
            relative_path: format!("ABC/{day}.jpg"),
            size_bytes: (gb * BYTES_PER_GB) as i64,
            recording_dt: Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap(),
            local_storage: true,
            archive_status: ArchiveStatus::Claimed,
            claim_id: None,
            bundle_id: None,
        }
    }

    #[test]
    fn sequential_grouper_cuts_at_max_size() {
        let files = vec![file(3, 4.0), file(1, 4.0), file(2, 4.0)];
        let groups = SequentialGrouper { max_group_gb: 10.0 }.group(&files);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_ids, vec![files[1].id, files[2].id]);
        assert_eq!(groups[1].file_ids, vec![files[0].id]);
        assert!((groups[0].total_size_gb - 8.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_single_file_gets_its_own_group() {
        let files = vec![file(1, 12.0), file(2, 1.0)];
        let groups = SequentialGrouper { max_group_gb: 10.0 }.group(&files);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_ids, vec![files[0].id]);
    }
}
