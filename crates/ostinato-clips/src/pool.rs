//! Content-addressed pool of decoded audio clips.
//!
//! The pool is read-only on the audio thread; imports and pruning are
//! structural operations driven by the main thread. Reference counts are
//! maintained by the region layer through `retain`/`release`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ClipError, Result};

/// Stable pool identifier for a clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClipId(pub u64);

/// Immutable decoded audio: interleaved f32 frames.
#[derive(Debug)]
pub struct AudioClip {
    pub id: ClipId,
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Optional tempo the material was recorded at, used by musical mode.
    pub source_bpm: Option<f32>,
    frames: Box<[f32]>,
}

impl AudioClip {
    /// Length in frames (samples per channel).
    #[inline]
    pub fn length_frames(&self) -> u64 {
        (self.frames.len() / self.channels.max(1) as usize) as u64
    }

    /// Sample at `(channel, frame)`. Callers must bound-check `frame`.
    #[inline]
    pub fn sample(&self, channel: u16, frame: u64) -> f32 {
        self.frames[frame as usize * self.channels as usize + channel as usize]
    }

    /// Checked sample read.
    #[inline]
    pub fn sample_checked(&self, channel: u16, frame: u64) -> Option<f32> {
        if channel < self.channels && frame < self.length_frames() {
            Some(self.sample(channel, frame))
        } else {
            None
        }
    }

    pub fn interleaved(&self) -> &[f32] {
        &self.frames
    }
}

struct PoolEntry {
    clip: Arc<AudioClip>,
    refs: AtomicUsize,
}

/// Content-addressed store of decoded clips, keyed by [`ClipId`].
///
/// Lifetime is the project lifetime; actually deleting unreferenced clips is
/// the project saver's job, driven by [`ClipPool::unreferenced_ids`].
pub struct ClipPool {
    entries: DashMap<ClipId, PoolEntry>,
    next_id: AtomicU64,
}

impl Default for ClipPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipPool {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> ClipId {
        ClipId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert already-decoded interleaved frames (synthesized content,
    /// recorded takes, tests).
    pub fn insert(
        &self,
        name: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        frames: Vec<f32>,
    ) -> Result<ClipId> {
        if frames.is_empty() || channels == 0 {
            return Err(ClipError::EmptyClip);
        }
        let id = self.allocate_id();
        let clip = AudioClip {
            id,
            name: name.into(),
            sample_rate,
            channels,
            source_bpm: None,
            frames: frames.into_boxed_slice(),
        };
        self.entries.insert(
            id,
            PoolEntry {
                clip: Arc::new(clip),
                refs: AtomicUsize::new(0),
            },
        );
        Ok(id)
    }

    /// Decode a WAV file into the pool.
    pub fn import_wav(&self, path: impl AsRef<Path>) -> Result<ClipId> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let frames: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => match spec.bits_per_sample {
                32 => reader.samples::<f32>().collect::<Result<_, _>>()?,
                bits => {
                    return Err(ClipError::UnsupportedFormat(format!(
                        "{bits}-bit float WAV"
                    )))
                }
            },
            hound::SampleFormat::Int => match spec.bits_per_sample {
                16 => reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| f32::from(v) / 32768.0))
                    .collect::<Result<_, _>>()?,
                24 | 32 => reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / (1i64 << (spec.bits_per_sample - 1)) as f32))
                    .collect::<Result<_, _>>()?,
                bits => return Err(ClipError::UnsupportedFormat(format!("{bits}-bit WAV"))),
            },
        };

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip".to_owned());

        let id = self.insert(name, spec.sample_rate, spec.channels, frames)?;
        info!(?id, path = %path.display(), "imported clip");
        Ok(id)
    }

    /// Tag a clip with the tempo it was recorded at.
    pub fn set_source_bpm(&self, id: ClipId, bpm: f32) -> Result<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(ClipError::UnknownClip(id))?;
        // Clips are immutable once shared; rebuild the Arc with the new tag.
        let clip = &entry.clip;
        let updated = AudioClip {
            id: clip.id,
            name: clip.name.clone(),
            sample_rate: clip.sample_rate,
            channels: clip.channels,
            source_bpm: Some(bpm),
            frames: clip.frames.clone(),
        };
        entry.clip = Arc::new(updated);
        Ok(())
    }

    pub fn get(&self, id: ClipId) -> Option<Arc<AudioClip>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.clip))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Region layer: a region now references `id`.
    pub fn retain(&self, id: ClipId) -> Result<()> {
        let entry = self.entries.get(&id).ok_or(ClipError::UnknownClip(id))?;
        entry.refs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Region layer: a region referencing `id` was removed.
    pub fn release(&self, id: ClipId) {
        if let Some(entry) = self.entries.get(&id) {
            let _ = entry
                .refs
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    n.checked_sub(1)
                });
        }
    }

    /// Clips with no live region references; the persistence collaborator
    /// decides whether to prune them.
    pub fn unreferenced_ids(&self) -> Vec<ClipId> {
        let mut ids: Vec<ClipId> = self
            .entries
            .iter()
            .filter(|e| e.refs.load(Ordering::Relaxed) == 0)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All clip ids, for the project snapshot.
    pub fn ids(&self) -> Vec<ClipId> {
        let mut ids: Vec<ClipId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frames(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 0.1).sin())
            .collect()
    }

    #[test]
    fn test_insert_and_get() {
        let pool = ClipPool::new();
        let id = pool.insert("test", 48000, 1, sine_frames(100)).unwrap();
        let clip = pool.get(id).unwrap();
        assert_eq!(clip.length_frames(), 100);
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.sample_rate, 48000);
    }

    #[test]
    fn test_empty_clip_rejected() {
        let pool = ClipPool::new();
        assert!(matches!(
            pool.insert("empty", 48000, 1, vec![]),
            Err(ClipError::EmptyClip)
        ));
    }

    #[test]
    fn test_stereo_indexing() {
        let pool = ClipPool::new();
        // Frames: (0.0, 1.0), (2.0, 3.0)
        let id = pool
            .insert("st", 44100, 2, vec![0.0, 1.0, 2.0, 3.0])
            .unwrap();
        let clip = pool.get(id).unwrap();
        assert_eq!(clip.length_frames(), 2);
        assert_eq!(clip.sample(0, 1), 2.0);
        assert_eq!(clip.sample(1, 1), 3.0);
        assert_eq!(clip.sample_checked(1, 2), None);
        assert_eq!(clip.sample_checked(2, 0), None);
    }

    #[test]
    fn test_refcounts_and_unreferenced() {
        let pool = ClipPool::new();
        let a = pool.insert("a", 48000, 1, sine_frames(10)).unwrap();
        let b = pool.insert("b", 48000, 1, sine_frames(10)).unwrap();

        pool.retain(a).unwrap();
        assert_eq!(pool.unreferenced_ids(), vec![b]);

        pool.release(a);
        let mut unref = pool.unreferenced_ids();
        unref.sort_unstable();
        assert_eq!(unref, vec![a, b]);

        // Release below zero saturates.
        pool.release(a);
        assert_eq!(pool.unreferenced_ids().len(), 2);
    }

    #[test]
    fn test_import_wav_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..480 {
            let v = ((i as f32 / 480.0) * std::f32::consts::TAU).sin();
            writer.write_sample((v * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let pool = ClipPool::new();
        let id = pool.import_wav(&path).unwrap();
        let clip = pool.get(id).unwrap();
        assert_eq!(clip.length_frames(), 480);
        assert_eq!(clip.sample_rate, 48000);
        // Decoded values stay inside the unit range.
        assert!(clip.interleaved().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_source_bpm_tag() {
        let pool = ClipPool::new();
        let id = pool.insert("loop", 48000, 1, sine_frames(10)).unwrap();
        pool.set_source_bpm(id, 98.0).unwrap();
        assert_eq!(pool.get(id).unwrap().source_bpm, Some(98.0));
    }
}
