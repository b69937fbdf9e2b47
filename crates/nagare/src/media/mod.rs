//! # Simulated live DASH origin
//!
//! Reads an on-disk DASH asset (manifest plus numbered fMP4 segments) and
//! replays it at wall-clock pace, so downstream readers observe a live feed.
//! A [`Media`] validates the manifest projection once; [`Media::start`] fixes
//! the session epoch and hands out one restartable [`MediaStream`] per track.
//! Each [`MediaSegment`] yields its top-level boxes lazily, sleeping until a
//! `moof`'s decode timestamp becomes current before releasing it.

pub mod mp4;
pub mod template;

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use dash_mpd::Representation;
use tokio::{fs::File, io::AsyncReadExt};

use crate::{
    error::{NagareError, NagareResult},
    util::read_exact_or_eof,
};
use template::Template;

/// One period, one audio and one video representation, numbered segments.
#[derive(Debug)]
pub struct Media {
    base: PathBuf,
    audio: Track,
    video: Track,
}

/// The typed projection of a representation's segment template.
#[derive(Clone, Debug)]
struct Track {
    id: String,
    initialization: String,
    media: String,
    duration: u64,
    timescale: u64,
    start_number: u64,
}

impl Media {
    pub async fn open(manifest: impl AsRef<Path>) -> NagareResult<Self> {
        let manifest = manifest.as_ref();
        let base = manifest.parent().unwrap_or(Path::new(".")).to_path_buf();

        let text = tokio::fs::read_to_string(manifest).await?;
        let mpd = dash_mpd::parse(&text)?;

        if mpd.periods.len() > 1 {
            return Err(NagareError::MultiplePeriods);
        }
        let period = mpd.periods.first().ok_or(NagareError::NoPeriod)?;

        let mut audio = None;
        let mut video = None;

        for adaptation in &period.adaptations {
            let Some(representation) = adaptation.representations.first() else {
                continue;
            };

            let mime = representation
                .mimeType
                .as_deref()
                .ok_or(NagareError::MissingMimeType)?;

            match mime {
                "video/mp4" => {
                    video = Some(Track::project(
                        representation,
                        adaptation.SegmentTemplate.as_ref(),
                    )?)
                }
                "audio/mp4" => {
                    audio = Some(Track::project(
                        representation,
                        adaptation.SegmentTemplate.as_ref(),
                    )?)
                }
                _ => {}
            }
        }

        let audio = audio.ok_or(NagareError::NoRepresentation("audio"))?;
        let video = video.ok_or(NagareError::NoRepresentation("video"))?;

        tracing::debug!(audio = %audio.id, video = %video.id, "opened manifest");

        Ok(Self { base, audio, video })
    }

    /// Fix the session epoch and seed both tracks.
    ///
    /// Returns the init map (representation id to cached init segment) and a
    /// fresh fragment iterator per track, all sharing the same epoch.
    pub async fn start(
        &self,
    ) -> NagareResult<(HashMap<String, Arc<MediaInit>>, MediaStream, MediaStream)> {
        let start = Instant::now();

        let audio = MediaStream::new(&self.base, &self.audio, start).await?;
        let video = MediaStream::new(&self.base, &self.video, start).await?;

        let mut inits = HashMap::new();
        inits.insert(self.audio.id.clone(), audio.init());
        inits.insert(self.video.id.clone(), video.init());

        Ok((inits, audio, video))
    }
}

impl Track {
    fn project(
        representation: &Representation,
        fallback: Option<&dash_mpd::SegmentTemplate>,
    ) -> NagareResult<Self> {
        let id = representation
            .id
            .clone()
            .ok_or(NagareError::MissingRepresentationId)?;

        let template = representation
            .SegmentTemplate
            .as_ref()
            .or(fallback)
            .ok_or(NagareError::MissingSegmentTemplate)?;

        let initialization = template
            .initialization
            .clone()
            .ok_or(NagareError::MissingTemplateField("initialization"))?;
        let media = template
            .media
            .clone()
            .ok_or(NagareError::MissingTemplateField("media"))?;
        let duration = template
            .duration
            .ok_or(NagareError::MissingTemplateField("duration"))?;
        if duration <= 0.0 {
            return Err(NagareError::MissingTemplateField("duration"));
        }
        let start_number = template
            .startNumber
            .ok_or(NagareError::MissingTemplateField("startNumber"))?;

        Ok(Self {
            id,
            initialization,
            media,
            duration: duration as u64,
            timescale: template.timescale.unwrap_or(1),
            start_number,
        })
    }
}

/// A parsed init segment: raw bytes plus the track timescale.
pub struct MediaInit {
    pub id: String,
    pub raw: Bytes,
    pub timescale: u32,
}

/// Restartable, finite fragment iterator for one representation.
pub struct MediaStream {
    base: PathBuf,
    track: Track,
    init: Arc<MediaInit>,
    start: Instant,
    sequence: u64,
}

impl MediaStream {
    async fn new(base: &Path, track: &Track, start: Instant) -> NagareResult<Self> {
        let path = base.join(
            Template::new()
                .representation_id(&track.id)
                .resolve(&track.initialization),
        );

        let raw = tokio::fs::read(&path).await?;
        let timescale = mp4::parse_timescale(&raw)?;

        let init = Arc::new(MediaInit {
            id: track.id.clone(),
            raw: raw.into(),
            timescale,
        });

        Ok(Self {
            base: base.to_path_buf(),
            track: track.clone(),
            init,
            start,
            sequence: track.start_number,
        })
    }

    /// The cached init segment for this track.
    pub fn init(&self) -> Arc<MediaInit> {
        self.init.clone()
    }

    /// Open the next fragment, or `None` once the asset runs out.
    ///
    /// `time_offset` is the pause time accumulated by the caller; it shifts
    /// this fragment's pacing deadline forward.
    pub async fn next(&mut self, time_offset: Duration) -> NagareResult<Option<MediaSegment>> {
        let path = self.base.join(
            Template::new()
                .representation_id(&self.track.id)
                .number(self.sequence)
                .resolve(&self.track.media),
        );

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // A missing first segment means the asset itself is broken;
                // a missing later segment is the end of the broadcast.
                if self.sequence == self.track.start_number {
                    return Err(NagareError::FirstSegmentMissing(path.display().to_string()));
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let offset = (self.sequence - self.track.start_number) as u32;
        let timestamp = self.fragment_duration() * offset;

        let segment = MediaSegment {
            init: self.init.clone(),
            file,
            timestamp,
            start: self.start,
            pause_offset: time_offset,
        };

        self.sequence += 1;
        Ok(Some(segment))
    }

    fn fragment_duration(&self) -> Duration {
        let nanos = self.track.duration as u128 * 1_000_000_000 / self.track.timescale as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// A single fragment, read box by box at live pace.
pub struct MediaSegment {
    init: Arc<MediaInit>,
    file: File,
    /// Wall-clock-relative timestamp of this fragment within the broadcast.
    pub timestamp: Duration,
    start: Instant,
    pause_offset: Duration,
}

impl MediaSegment {
    pub fn init(&self) -> &Arc<MediaInit> {
        &self.init
    }

    /// Read the next top-level box, sleeping until its decode timestamp is
    /// due. Returns `None` at the end of the fragment.
    pub async fn read(&mut self) -> NagareResult<Option<Bytes>> {
        let mut header = [0u8; 8];
        if !read_exact_or_eof(&mut self.file, &mut header).await? {
            return Ok(None);
        }

        let size = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        if size < 8 {
            return Err(NagareError::BoxTooSmall);
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.extend_from_slice(&header);
        buf.resize(size, 0);
        self.file.read_exact(&mut buf[8..]).await?;

        if let Some(sample) = mp4::parse_sample(&buf, self.init.timescale)? {
            // Simulate a live feed: hold the moof until its decode timestamp,
            // shifted by however long the session has been paused.
            let elapsed = self.start.elapsed();
            let due = sample.timestamp + self.pause_offset;
            if due > elapsed {
                tokio::time::sleep(due - elapsed).await;
            }
        }

        Ok(Some(buf.freeze()))
    }
}
