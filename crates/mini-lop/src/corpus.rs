//! On-disk seed queue, crash folder, and the coverage bookkeeping that
//! decides what gets to stay.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info};

use crate::{
    error::{FuzzerError, Result},
    feedback::Edge,
    util::write_atomic,
};

/// One retained input. Everything except `favoured` is fixed at admission.
#[derive(Debug)]
pub struct Seed {
    pub id: usize,
    pub path: PathBuf,
    /// Edges covered by the execution that admitted this seed.
    pub coverage: HashSet<Edge>,
    /// Wall-clock duration of that execution, in seconds.
    pub exec_time: f64,
    /// Input length in bytes.
    pub size: usize,
    pub favoured: bool,
}

impl Seed {
    /// Ranking key for favoured-seed selection: smaller is better.
    pub fn valuation(&self) -> f64 {
        self.size as f64 * self.exec_time
    }
}

#[derive(Debug)]
pub struct SeedStore {
    queue_dir: PathBuf,
    crashes_dir: PathBuf,
    seeds: Vec<Seed>,
    global_coverage: HashSet<Edge>,
    edge_to_seeds: HashMap<Edge, Vec<usize>>,
}

impl SeedStore {
    pub fn new(queue_dir: PathBuf, crashes_dir: PathBuf) -> Result<Self> {
        for dir in [&queue_dir, &crashes_dir] {
            if !dir.is_dir() {
                return Err(FuzzerError::init(format!(
                    "required folder {} is missing",
                    dir.display()
                )));
            }
        }
        Ok(Self {
            queue_dir,
            crashes_dir,
            seeds: Vec::new(),
            global_coverage: HashSet::new(),
            edge_to_seeds: HashMap::new(),
        })
    }

    /// Retains `input` as a new seed, unless its coverage is already fully
    /// contained in the global set. Returns the new seed id on admission.
    pub fn admit(
        &mut self,
        input: &[u8],
        coverage: HashSet<Edge>,
        exec_time: f64,
    ) -> Result<Option<usize>> {
        if coverage.is_subset(&self.global_coverage) {
            return Ok(None);
        }

        let id = self.seeds.len();
        let path = self.queue_dir.join(format!("id_{id}"));
        write_atomic(&path, input)?;

        for &edge in &coverage {
            self.edge_to_seeds.entry(edge).or_default().push(id);
        }
        self.global_coverage.extend(coverage.iter().copied());

        info!(
            id,
            edges = coverage.len(),
            total_edges = self.global_coverage.len(),
            size = input.len(),
            "new seed admitted"
        );
        self.seeds.push(Seed {
            id,
            path,
            coverage,
            exec_time,
            size: input.len(),
            favoured: false,
        });
        Ok(Some(id))
    }

    /// Persists a crashing input. Filenames carry the admission time and the
    /// originating seed, nothing more; identical crashes are kept as-is.
    pub fn save_crash(
        &self,
        input: &[u8],
        origin: Option<&Path>,
        status: i32,
    ) -> Result<PathBuf> {
        let unix_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs();
        let mut name = format!("crash_{unix_ts}");
        if let Some(basename) = origin.and_then(|path| path.file_name()) {
            name.push('_');
            name.push_str(&basename.to_string_lossy());
        }
        let path = self.crashes_dir.join(name);
        write_atomic(&path, input)?;
        debug!(status, path = %path.display(), "crash saved");
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn get(&self, id: usize) -> &Seed {
        &self.seeds[id]
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    pub fn global_coverage(&self) -> &HashSet<Edge> {
        &self.global_coverage
    }

    /// Number of edges in `edges` not yet present in the global set.
    pub fn novel_edge_count(&self, edges: &HashSet<Edge>) -> usize {
        edges.difference(&self.global_coverage).count()
    }

    /// Seed-id lists per covered edge, for favoured-seed selection.
    pub fn edge_entries(&self) -> impl Iterator<Item = (Edge, &[usize])> {
        self.edge_to_seeds
            .iter()
            .map(|(&edge, ids)| (edge, ids.as_slice()))
    }

    /// Replaces the favoured marking wholesale: exactly the seeds in
    /// `winners` end up favoured.
    pub fn set_favoured(&mut self, winners: &HashSet<usize>) {
        for seed in &mut self.seeds {
            seed.favoured = winners.contains(&seed.id);
        }
    }

    pub fn favoured_count(&self) -> usize {
        self.seeds.iter().filter(|seed| seed.favoured).count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn store(dir: &tempfile::TempDir) -> SeedStore {
        let queue = dir.path().join("queue");
        let crashes = dir.path().join("crashes");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&crashes).unwrap();
        SeedStore::new(queue, crashes).unwrap()
    }

    #[test]
    fn missing_folder_is_an_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SeedStore::new(dir.path().join("nope"), dir.path().to_path_buf());
        assert!(matches!(result, Err(FuzzerError::Init(_))));
    }

    #[test]
    fn admission_assigns_dense_ids_and_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);

        let id = store.admit(b"aaaa", HashSet::from([1, 2]), 0.1).unwrap();
        assert_eq!(id, Some(0));
        let id = store.admit(b"bbbb", HashSet::from([3]), 0.1).unwrap();
        assert_eq!(id, Some(1));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0).id, 0);
        assert_eq!(store.get(1).id, 1);
        assert_eq!(std::fs::read(&store.get(0).path).unwrap(), b"aaaa");
        assert!(store.get(1).path.ends_with("id_1"));
    }

    #[test]
    fn admission_guard_rejects_covered_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);

        store.admit(b"aaaa", HashSet::from([1, 2, 3]), 0.1).unwrap();
        // Strict subset of the global set: not admitted.
        assert_eq!(store.admit(b"bbbb", HashSet::from([1, 3]), 0.1).unwrap(), None);
        // One novel edge is enough.
        assert_eq!(
            store.admit(b"cccc", HashSet::from([1, 4]), 0.1).unwrap(),
            Some(1)
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn global_coverage_is_the_union_of_seed_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);

        store.admit(b"a", HashSet::from([1, 2]), 0.1).unwrap();
        store.admit(b"b", HashSet::from([2, 3]), 0.2).unwrap();
        store.admit(b"c", HashSet::from([9]), 0.3).unwrap();

        let union: HashSet<Edge> = store
            .seeds()
            .iter()
            .flat_map(|seed| seed.coverage.iter().copied())
            .collect();
        assert_eq!(&union, store.global_coverage());
        assert_eq!(store.novel_edge_count(&HashSet::from([2, 3, 4, 5])), 2);
    }

    #[test]
    fn edge_index_matches_seed_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);

        store.admit(b"a", HashSet::from([1, 2]), 0.1).unwrap();
        store.admit(b"b", HashSet::from([2, 3]), 0.2).unwrap();

        for (edge, ids) in store.edge_entries() {
            for &id in ids {
                assert!(store.get(id).coverage.contains(&edge));
            }
        }
        for seed in store.seeds() {
            for &edge in &seed.coverage {
                let (_, ids) = store
                    .edge_entries()
                    .find(|&(candidate, _)| candidate == edge)
                    .unwrap();
                assert!(ids.contains(&seed.id));
            }
        }
    }

    #[test]
    fn crash_filenames_carry_the_origin() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let path = store
            .save_crash(b"boom", Some(Path::new("/queue/id_7")), 11)
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("crash_"));
        assert!(name.ends_with("_id_7"));
        assert_eq!(std::fs::read(&path).unwrap(), b"boom");

        let anonymous = store.save_crash(b"boom", None, 11).unwrap();
        assert!(!anonymous.file_name().unwrap().to_string_lossy().contains("id_"));
    }
}
