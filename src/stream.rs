// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! RTSP input, behind a narrow trait for test injection.
//!
//! The real implementation delegates the protocol to the Retina library but
//! imposes this program's option set: TCP transport only, a 5-second I/O
//! deadline, and low-latency session options. The rest of the program sees
//! only [`Packet`]s and the track parameter structs below, so library
//! specifics (including how audio channel layouts are represented) stay
//! behind this seam.

use std::pin::Pin;
use std::time::Duration;

use base::{err, Error};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use tracing::{debug, warn};
use url::Url;

/// Per-read deadline, matching the RTSP socket timeout.
pub static RTSP_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the whole DESCRIBE/SETUP/PLAY handshake (several round trips
/// at the socket budget above).
static RTSP_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Track {
    Video,
    Audio,
}

/// One demuxed media packet, in the track's timebase units.
#[derive(Clone, Debug)]
pub struct Packet {
    pub track: Track,
    pub dts: i64,
    pub pts: i64,
    /// 0 when the source doesn't know; the timestamp normalizer synthesizes
    /// one.
    pub duration: i64,
    pub is_key: bool,
    pub data: Bytes,
}

/// Video track parameters. `sample_entry` holds the complete `avc1`
/// (or similar) box bytes, copied into the output verbatim.
#[derive(Clone, Debug)]
pub struct VideoStreamInfo {
    pub sample_entry: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,
    /// Timestamp units per second for this track's packets.
    pub timescale: u32,
    pub frame_rate: Option<(u32, u32)>,
}

/// Audio track parameters as the adapter exposes them.
#[derive(Clone, Debug)]
pub struct AudioStreamInfo {
    pub sample_entry: Vec<u8>,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Samples per coded frame (e.g. 1024 for AAC), if known.
    pub frame_length: Option<u32>,
}

/// Best-effort read of channel count and sample size from an `mp4a`-style
/// sample entry: box header (8) + reserved (6) + data_reference_index (2) +
/// version/revision/vendor (8) + channelcount (2) + samplesize (2).
fn parse_audio_sample_entry(entry: &[u8]) -> (u16, u16) {
    if entry.len() < 28 {
        return (1, 16);
    }
    let channels = u16::from_be_bytes([entry[24], entry[25]]);
    let bits = u16::from_be_bytes([entry[26], entry[27]]);
    (channels.max(1), if bits == 0 { 16 } else { bits })
}

/// Why an input session couldn't be established. The distinctions matter to
/// the recorder: connect failures are retried with backoff against a null
/// session, stream-info failures may keep the session, and a URL with no
/// video stream idles the recorder until its configuration changes.
#[derive(Debug)]
pub enum OpenError {
    Connect(Error),
    StreamInfo(Error),
    NoVideoStream,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Connect(e) => write!(f, "input open failed: {}", e.chain()),
            OpenError::StreamInfo(e) => write!(f, "stream info failed: {}", e.chain()),
            OpenError::NoVideoStream => f.write_str("no video stream"),
        }
    }
}

/// A failed read from an established session.
#[derive(Debug)]
pub enum StreamError {
    /// Nothing available right now; try again shortly.
    Again,
    /// Clean end of stream. The session must be discarded.
    Eof,
    Receive(Error),
}

pub struct Options {
    pub include_audio: bool,
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL.
    ///
    /// Note: despite the blocking interface, the Retina implementation
    /// expects to be called from the context of a multithreaded tokio
    /// runtime with IO and time enabled.
    fn open(&self, label: &str, url: &Url, options: Options)
        -> Result<Box<dyn Stream>, OpenError>;
}

/// An established input session yielding demuxed packets.
pub trait Stream: Send {
    fn video(&self) -> &VideoStreamInfo;
    fn audio(&self) -> Option<&AudioStreamInfo>;
    fn next(&mut self) -> Result<Packet, StreamError>;
}

pub struct RetinaOpener;

pub const OPENER: RetinaOpener = RetinaOpener;

impl Opener for RetinaOpener {
    fn open(
        &self,
        label: &str,
        url: &Url,
        options: Options,
    ) -> Result<Box<dyn Stream>, OpenError> {
        if url.scheme() != "rtsp" {
            return Err(OpenError::Connect(err!(
                InvalidArgument,
                msg("only rtsp:// URLs are supported (transport is always TCP), got {url}")
            )));
        }
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(rt_handle.spawn(tokio::time::timeout(
                RTSP_OPEN_TIMEOUT,
                RetinaStreamInner::play(label.to_owned(), url.clone(), options),
            )))
            .expect("RetinaStreamInner::play task panicked, see earlier error")
            .map_err(|e| {
                OpenError::Connect(err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within {RTSP_OPEN_TIMEOUT:?}"),
                    source(e),
                ))
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the recorder loop expects a
/// synchronous stream interface, so this blocks on the tokio operations.
/// Ownership of the inner state is passed to the spawned task for each
/// operation and returned when it completes, keeping the task `'static`.
struct RetinaStream {
    inner: Option<Box<RetinaStreamInner>>,
    rt_handle: tokio::runtime::Handle,

    /// The first video frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of getting the
    /// video parameters.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video: VideoStreamInfo,
    audio: Option<AudioStreamInfo>,
}

fn video_params_to_info(
    params: &retina::codec::VideoParameters,
) -> Result<VideoStreamInfo, Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(OutOfRange, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(OutOfRange, source(e)))?;
    Ok(VideoStreamInfo {
        // Codec parameters are copied verbatim; any pixel aspect ratio the
        // camera declares rides along inside the sample entry.
        sample_entry: params
            .mp4_sample_entry()
            .build()
            .map_err(|e| err!(Unknown, source(e)))?,
        rfc6381_codec: params.rfc6381_codec().to_owned(),
        width,
        height,
        // Retina normalizes video timestamps to a 90 kHz timebase.
        timescale: 90_000,
        frame_rate: params.frame_rate(),
    })
}

fn audio_params_to_info(
    params: &retina::codec::AudioParameters,
) -> Result<AudioStreamInfo, Error> {
    let sample_entry = params
        .mp4_sample_entry()
        .build()
        .map_err(|e| err!(Unknown, source(e)))?;
    let (channels, bits_per_sample) = parse_audio_sample_entry(&sample_entry);
    Ok(AudioStreamInfo {
        sample_entry,
        channels,
        sample_rate: params.clock_rate(),
        bits_per_sample,
        frame_length: params.frame_length().map(std::num::NonZeroU32::get),
    })
}

impl RetinaStreamInner {
    /// Plays to the first video keyframe. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), OpenError> {
        let mut session = retina::client::Session::describe(
            url,
            retina::client::SessionOptions::default()
                .user_agent(format!("LightNVR {}", env!("CARGO_PKG_VERSION")))
                .teardown(retina::client::TeardownPolicy::Auto),
        )
        .await
        .map_err(|e| OpenError::Connect(err!(Unavailable, source(e))))?;
        debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .position(|s| {
                s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265" | "jpeg")
            })
            .ok_or(OpenError::NoVideoStream)?;
        session
            .setup(
                video_i,
                retina::client::SetupOptions::default().transport(
                    retina::client::Transport::Tcp(retina::client::TcpTransportOptions::default()),
                ),
            )
            .await
            .map_err(|e| OpenError::StreamInfo(err!(Unknown, source(e))))?;

        let audio_i = if options.include_audio {
            // Only audio streams whose codec can be placed into a .mp4 file
            // without transcoding are usable.
            session.streams().iter().enumerate().find_map(|(i, s)| {
                match s.parameters() {
                    Some(retina::codec::ParametersRef::Audio(a))
                        if a.mp4_sample_entry().build().is_ok() =>
                    {
                        Some(i)
                    }
                    _ => None,
                }
            })
        } else {
            None
        };
        let audio_i = match audio_i {
            Some(i) => {
                match session
                    .setup(
                        i,
                        retina::client::SetupOptions::default().transport(
                            retina::client::Transport::Tcp(
                                retina::client::TcpTransportOptions::default(),
                            ),
                        ),
                    )
                    .await
                {
                    Ok(()) => Some(i),
                    Err(e) => {
                        warn!(
                            "{label}: audio stream setup failed, recording video only: {e}"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| OpenError::StreamInfo(err!(Unknown, source(e))))?;
        let mut session = session
            .demuxed()
            .map_err(|e| OpenError::StreamInfo(err!(Unknown, source(e))))?;

        // First frame. Parameters for some streams aren't known until then.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => {
                    return Err(OpenError::StreamInfo(err!(
                        Unavailable,
                        msg("stream closed before first frame")
                    )))
                }
                Some(Err(e)) => {
                    return Err(OpenError::StreamInfo(err!(
                        Unknown,
                        msg("unable to get first frame"),
                        source(e)
                    )))
                }
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
            _ => {
                return Err(OpenError::StreamInfo(err!(
                    Unknown,
                    msg("couldn't find video parameters")
                )))
            }
        };
        let video = video_params_to_info(&video_params).map_err(OpenError::StreamInfo)?;
        debug!(
            "{label}: video {}x{} ({})",
            video.width, video.height, video.rfc6381_codec
        );
        let audio = match audio_i {
            Some(i) => match session.streams()[i].parameters() {
                Some(retina::codec::ParametersRef::Audio(a)) => {
                    Some(audio_params_to_info(a).map_err(OpenError::StreamInfo)?)
                }
                _ => None,
            },
            None => None,
        };
        if let Some(a) = &audio {
            debug!(
                "{label}: audio {} ch, {} Hz, {}-bit",
                a.channels, a.sample_rate, a.bits_per_sample
            );
        }
        let self_ = Box::new(Self {
            label,
            session,
            video,
            audio,
        });
        Ok((self_, first_frame))
    }

    /// Fetches the next usable frame.
    async fn fetch_next_frame(
        mut self: Box<Self>,
    ) -> Result<(Box<Self>, CodecItem), Option<Error>> {
        loop {
            match Pin::new(&mut self.session).next().await {
                None => return Err(None), // end of stream
                Some(Err(e)) => return Err(Some(err!(Unknown, source(e)))),
                Some(Ok(item @ CodecItem::VideoFrame(_)))
                | Some(Ok(item @ CodecItem::AudioFrame(_))) => return Ok((self, item)),
                Some(Ok(_)) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn video(&self) -> &VideoStreamInfo {
        &self.inner.as_ref().expect("inner present between ops").video
    }

    fn audio(&self) -> Option<&AudioStreamInfo> {
        self.inner
            .as_ref()
            .expect("inner present between ops")
            .audio
            .as_ref()
    }

    fn next(&mut self) -> Result<Packet, StreamError> {
        if let Some(f) = self.first_frame.take() {
            let pts = f.timestamp().elapsed();
            return Ok(Packet {
                track: Track::Video,
                dts: pts,
                pts,
                duration: 0,
                is_key: f.is_random_access_point(),
                data: f.into_data().into(),
            });
        }
        let inner = self.inner.take().expect("inner present between ops");
        let label = inner.label.clone();
        let r = self
            .rt_handle
            .block_on(self.rt_handle.spawn(tokio::time::timeout(
                RTSP_IO_TIMEOUT,
                inner.fetch_next_frame(),
            )))
            .expect("fetch_next_frame task panicked, see earlier error");
        let (inner, item) = match r {
            Err(elapsed) => {
                return Err(StreamError::Receive(err!(
                    DeadlineExceeded,
                    msg("no packet within {RTSP_IO_TIMEOUT:?}"),
                    source(elapsed)
                )))
            }
            Ok(Err(None)) => return Err(StreamError::Eof),
            Ok(Err(Some(e))) => return Err(StreamError::Receive(e)),
            Ok(Ok(v)) => v,
        };
        let pkt = match item {
            CodecItem::VideoFrame(f) => {
                if f.loss() > 0 {
                    warn!(
                        "{}: lost {} RTP packets @ {}",
                        &label,
                        f.loss(),
                        f.start_ctx()
                    );
                }
                if f.has_new_parameters() {
                    // The output file's sample entry can't change mid-file;
                    // keep writing with the original parameters.
                    warn!("{}: video parameters changed mid-stream", &label);
                }
                let pts = f.timestamp().elapsed();
                Packet {
                    track: Track::Video,
                    dts: pts,
                    pts,
                    duration: 0,
                    is_key: f.is_random_access_point(),
                    data: f.into_data().into(),
                }
            }
            CodecItem::AudioFrame(f) => {
                let pts = f.timestamp().elapsed();
                Packet {
                    track: Track::Audio,
                    dts: pts,
                    pts,
                    duration: 0,
                    is_key: false,
                    data: f.data().to_vec().into(),
                }
            }
            _ => unreachable!("fetch_next_frame yields only video and audio"),
        };
        self.inner = Some(inner);
        Ok(pkt)
    }
}
