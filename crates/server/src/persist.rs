use crate::store::{Booking, Snapshot};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Pluggable persistence seam. The server is fully functional with no
/// storage attached; failures on save are logged by the caller and never
/// fail the request that triggered them.
pub trait Storage: Send + Sync {
    fn load(&self) -> Result<Option<Snapshot>>;
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct FacilityRecord {
    name: String,
    bookings: Vec<Booking>,
}

/// Two JSON files in a data directory: `facilities.json`, an object keyed by
/// facility name with the bookings nested per facility, and `bookings.json`,
/// the same bookings as one flat array. The nested file is authoritative on
/// load; the flat one exists for external consumers.
pub struct JsonStorage {
    facilities_file: PathBuf,
    bookings_file: PathBuf,
}

impl JsonStorage {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;

        Ok(Self {
            facilities_file: dir.join("facilities.json"),
            bookings_file: dir.join("bookings.json"),
        })
    }
}

impl Storage for JsonStorage {
    fn load(&self) -> Result<Option<Snapshot>> {
        if !self.facilities_file.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&self.facilities_file)
            .with_context(|| format!("reading {}", self.facilities_file.display()))?;
        let records: BTreeMap<String, FacilityRecord> =
            serde_json::from_str(&text).context("parsing facilities file")?;

        let facilities = records
            .into_values()
            .map(|record| (record.name, record.bookings))
            .collect();
        Ok(Some(Snapshot { facilities }))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut records = BTreeMap::new();
        let mut flat: Vec<&Booking> = Vec::new();

        for (name, bookings) in &snapshot.facilities {
            flat.extend(bookings);
            records.insert(
                name,
                FacilityRecord {
                    name: name.clone(),
                    bookings: bookings.clone(),
                },
            );
        }
        flat.sort_by_key(|b| b.id);

        let text = serde_json::to_string_pretty(&records)?;
        fs::write(&self.facilities_file, text)
            .with_context(|| format!("writing {}", self.facilities_file.display()))?;

        let text = serde_json::to_string_pretty(&flat)?;
        fs::write(&self.bookings_file, text)
            .with_context(|| format!("writing {}", self.bookings_file.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "booking-persist-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn booking(id: u32, facility: &str, start: u32, end: u32) -> Booking {
        Booking {
            id,
            facility: facility.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn missing_files_load_as_none() {
        let dir = scratch_dir();
        let storage = JsonStorage::open(&dir).unwrap();
        assert!(storage.load().unwrap().is_none());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = scratch_dir();
        let storage = JsonStorage::open(&dir).unwrap();

        let snapshot = Snapshot {
            facilities: vec![
                (
                    "Lab_101".to_string(),
                    vec![booking(1, "Lab_101", 100, 200), booking(3, "Lab_101", 300, 400)],
                ),
                ("Lab_102".to_string(), vec![booking(2, "Lab_102", 100, 200)]),
            ],
        };
        storage.save(&snapshot).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.facilities, snapshot.facilities);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn files_use_the_documented_layout() {
        let dir = scratch_dir();
        let storage = JsonStorage::open(&dir).unwrap();

        let snapshot = Snapshot {
            facilities: vec![("Lab_101".to_string(), vec![booking(7, "Lab_101", 100, 200)])],
        };
        storage.save(&snapshot).unwrap();

        let facilities: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("facilities.json")).unwrap())
                .unwrap();
        assert_eq!(facilities["Lab_101"]["name"], "Lab_101");
        assert_eq!(facilities["Lab_101"]["bookings"][0]["booking_id"], 7);
        assert_eq!(facilities["Lab_101"]["bookings"][0]["facility_name"], "Lab_101");
        assert_eq!(facilities["Lab_101"]["bookings"][0]["start_time"], 100);
        assert_eq!(facilities["Lab_101"]["bookings"][0]["end_time"], 200);

        let bookings: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("bookings.json")).unwrap()).unwrap();
        assert_eq!(bookings[0]["booking_id"], 7);
        fs::remove_dir_all(&dir).unwrap();
    }
}
