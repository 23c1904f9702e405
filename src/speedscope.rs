use std::collections::{BTreeMap, HashMap};

use crate::decoder::Batch;

/*
 * The struct definitions below follow the speedscope sources in rbspy:
 * https://github.com/rbspy/rbspy/blob/d408b12dfc906292e1e85e6152a38416ed3a18e5/src/ui/speedscope.rs
 *
 * The file format is described at
 * https://github.com/jlfwong/speedscope/blob/9d13d9/src/lib/file-format-spec.ts
 *
 * We emit the "sampled" variant: one profile per thread, one sample per capture pass.
 */

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeedscopeFile {
    #[serde(rename = "$schema")]
    schema: String,
    profiles: Vec<Profile>,
    shared: Shared,

    #[serde(rename = "activeProfileIndex")]
    active_profile_index: Option<f64>,

    exporter: Option<String>,

    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    #[serde(rename = "type")]
    profile_type: ProfileType,

    name: String,
    unit: ValueUnit,

    #[serde(rename = "startValue")]
    start_value: f64,

    #[serde(rename = "endValue")]
    end_value: f64,

    samples: Vec<Vec<usize>>,
    weights: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Shared {
    frames: Vec<Frame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
enum ProfileType {
    #[serde(rename = "sampled")]
    Sampled,
}

#[derive(Debug, Serialize, Deserialize)]
enum ValueUnit {
    #[serde(rename = "none")]
    None,
}

/// Keeps a list of unique names; the index of a name never changes once assigned.
#[derive(Default)]
struct NameIndex {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl NameIndex {
    fn get_or_insert(&mut self, name: &str) -> usize {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        self.names.push(name.to_string());
        let index = self.names.len() - 1;
        self.index.insert(name.to_string(), index);
        index
    }
}

impl SpeedscopeFile {
    /// Merges decoded batches into one profile per thread.
    ///
    /// Threads are told apart by handle and native id. Codes are per batch, so frames are
    /// merged by name.
    pub fn from_batches(batches: &[Batch]) -> SpeedscopeFile {
        let mut frames = NameIndex::default();
        let mut threads: BTreeMap<(u32, u32), (String, Vec<Vec<usize>>)> = BTreeMap::new();

        for batch in batches {
            for sample in &batch.samples {
                // Stacks arrive innermost first; speedscope wants the root first.
                let stack: Vec<usize> = sample
                    .frames
                    .iter()
                    .rev()
                    .map(|frame| frames.get_or_insert(&frame.name))
                    .collect();
                let entry = threads
                    .entry((sample.thread, sample.native_id))
                    .or_insert_with(|| (sample.thread_name.clone(), Vec::new()));
                if entry.0.is_empty() {
                    entry.0 = sample.thread_name.clone();
                }
                entry.1.push(stack);
            }
        }

        let profiles = threads
            .into_iter()
            .map(|((thread, native_id), (thread_name, samples))| {
                let name = if thread_name.is_empty() {
                    format!("thread {:#x} (os {})", thread, native_id)
                } else {
                    format!("{} (os {})", thread_name, native_id)
                };
                Profile {
                    profile_type: ProfileType::Sampled,
                    name,
                    unit: ValueUnit::None,
                    start_value: 0.0,
                    end_value: samples.len() as f64,
                    weights: vec![1.0; samples.len()],
                    samples,
                }
            })
            .collect();

        SpeedscopeFile {
            schema: "https://www.speedscope.app/file-format-schema.json".to_string(),
            active_profile_index: None,
            name: Some("stackshot profile".to_string()),
            exporter: Some(format!("stackshot@{}", env!("CARGO_PKG_VERSION"))),
            profiles,
            shared: Shared {
                frames: frames
                    .names
                    .into_iter()
                    .map(|name| Frame { name })
                    .collect(),
            },
        }
    }
}
