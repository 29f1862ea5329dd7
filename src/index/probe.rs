//! Recording duration from container headers.

use std::fs::File;
use std::path::Path;

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{CallIndexError, Result};

/// Duration in milliseconds of the default track, when the container declares
/// its frame count and sample rate. Only headers are read, never the audio.
pub fn probe_duration_ms(path: &Path, extension: &str) -> Result<Option<i64>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if !extension.is_empty() {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CallIndexError::Probe(format!("{}: {}", path.display(), e)))?;

    let Some(track) = probed.format.default_track() else {
        return Ok(None);
    };

    let params = &track.codec_params;
    match (params.n_frames, params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => {
            let ms = u128::from(frames) * 1000 / u128::from(rate);
            Ok(Some(i64::try_from(ms).unwrap_or(i64::MAX)))
        }
        _ => Ok(None),
    }
}

/// Best-effort variant used by the indexer: any failure means "unknown".
pub fn duration_or_none(path: &Path, extension: &str) -> Option<i64> {
    match probe_duration_ms(path, extension) {
        Ok(duration) => duration,
        Err(e) => {
            log::debug!("Duration probe skipped: {}", e);
            None
        }
    }
}
