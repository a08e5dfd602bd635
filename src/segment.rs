// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The segment writer: drives one RTSP input session through one MP4 output
//! file for a bounded duration, bracketed by keyframes.
//!
//! Segment progress is an explicit state machine with a single-threaded
//! driver reading from the blocking packet stream:
//!
//! ```text
//! WaitFirstKeyframe → Recording → WaitFinalKeyframe → done
//! ```
//!
//! Audio packets are dropped until the video state reaches `Recording`,
//! which synchronizes the file to video GOP boundaries; audio is never a
//! reason to extend a segment. A shutdown signal is observed between
//! packets and steers the machine into `WaitFinalKeyframe` so the file still
//! ends at a safe cut point (or after the 2-second grace).

use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown;
use base::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::mp4;
use crate::normalize::Normalizer;
use crate::stream::{self, OpenError, Stream, StreamError, Track};

/// How long to keep writing past the cut decision while waiting for a
/// keyframe before giving up and closing on a non-key frame.
pub const FINAL_KEYFRAME_GRACE: Duration = Duration::from_secs(2);

/// Sleep between polls when the input reports nothing available.
const AGAIN_SLEEP: Duration = Duration::from_millis(10);

/// Cross-segment state, owned by the stream recorder and destroyed whenever
/// the input connection is abandoned.
#[derive(Clone, Debug, Default)]
pub struct ContinuityState {
    /// 0-based within the current ingest session.
    pub segment_index: u32,

    /// Whether this session's files carry an audio track; decided by the
    /// first segment and sticky until reconnect.
    pub has_audio: Option<bool>,

    /// True iff the last packet written to the previous segment was a
    /// keyframe, letting the next segment start recording immediately.
    pub last_frame_was_key: bool,
}

impl ContinuityState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    WaitFirstKeyframe,
    Recording,
    WaitFinalKeyframe {
        /// Monotonic time the wait began; the grace runs from here.
        since: Duration,
        cause: CloseReason,
    },
}

/// Why a segment stopped consuming input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The configured duration elapsed and a cut point was found.
    DurationReached,
    /// A latched shutdown signal was observed.
    Shutdown,
    /// The input session ended cleanly; it must be discarded.
    EndOfStream,
    /// A read failed; the segment closes short.
    PacketError,
    /// The muxer rejected a write; the segment closes short.
    WriteError,
}

#[derive(Clone, Debug)]
pub struct SegmentOutcome {
    pub close: CloseReason,
    pub video_packets: u64,
    pub audio_packets: u64,
    /// True iff the final written packet was a keyframe.
    pub ended_on_keyframe: bool,
    pub file: Option<mp4::FinishedFile>,
}

/// Failures that prevented the segment from producing anything; mapped onto
/// the recorder's retry/idle policies.
#[derive(Debug)]
pub enum SegmentError {
    InputOpen(Error),
    StreamInfo(Error),
    NoVideoStream,
    OutputOpen(Error),
    HeaderWrite(Error),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::InputOpen(e) => write!(f, "input open failed: {}", e.chain()),
            SegmentError::StreamInfo(e) => write!(f, "stream info failed: {}", e.chain()),
            SegmentError::NoVideoStream => f.write_str("no video stream"),
            SegmentError::OutputOpen(e) => write!(f, "output open failed: {}", e.chain()),
            SegmentError::HeaderWrite(e) => write!(f, "header write failed: {}", e.chain()),
        }
    }
}

impl From<OpenError> for SegmentError {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::Connect(e) => SegmentError::InputOpen(e),
            OpenError::StreamInfo(e) => SegmentError::StreamInfo(e),
            OpenError::NoVideoStream => SegmentError::NoVideoStream,
        }
    }
}

pub struct SegmentRequest<'a> {
    pub label: &'a str,
    pub url: &'a Url,
    pub output_path: &'a Path,
    pub max_duration: Duration,
    pub include_audio: bool,
    pub mux: mp4::MuxOptions,
}

/// Records one segment.
///
/// On entry with `*session == None`, opens the RTSP source and hands the
/// session back through `session` for reuse by the next segment. The
/// continuity state advances on success; the caller resets it whenever it
/// discards the session.
pub fn record_segment<C: Clocks>(
    clocks: &C,
    opener: &dyn stream::Opener,
    req: &SegmentRequest,
    session: &mut Option<Box<dyn Stream>>,
    continuity: &mut ContinuityState,
    shutdown_rx: &shutdown::Receiver,
) -> Result<SegmentOutcome, SegmentError> {
    if session.is_none() {
        debug!("{}: opening input {}", req.label, req.url);
        *session = Some(opener.open(
            req.label,
            req.url,
            stream::Options {
                include_audio: req.include_audio,
            },
        )?);
        // Fresh connection, fresh continuity.
        *continuity = ContinuityState::new();
    }
    let input = session
        .as_mut()
        .expect("session was just ensured to be present");

    let has_audio = match continuity.has_audio {
        Some(v) => v,
        None => {
            let v = req.include_audio && input.audio().is_some();
            continuity.has_audio = Some(v);
            v
        }
    };

    let file = fs::File::create(req.output_path)
        .map_err(|e| SegmentError::OutputOpen(e.into()))?;
    let mut mux = mp4::Fmp4Writer::new(
        BufWriter::new(file),
        input.video(),
        if has_audio { input.audio() } else { None },
        req.mux,
    )
    .map_err(SegmentError::HeaderWrite)?;

    let mut norm = Normalizer::new(
        continuity.segment_index,
        input.video(),
        if has_audio { input.audio() } else { None },
    );

    let start = clocks.monotonic();
    let mut state = if continuity.segment_index > 0 && continuity.last_frame_was_key {
        // Start-of-GOP handshake: the previous segment ended on a keyframe,
        // so recording may begin without waiting for a fresh one.
        State::Recording
    } else {
        State::WaitFirstKeyframe
    };
    let mut video_packets = 0u64;
    let mut audio_packets = 0u64;
    let mut ended_on_keyframe = false;

    let close = loop {
        // Shutdown is observed here, between packets.
        if shutdown_rx.check().is_err() {
            match state {
                State::WaitFirstKeyframe => break CloseReason::Shutdown,
                State::Recording => {
                    info!("{}: shutdown latched; closing at next keyframe", req.label);
                    state = State::WaitFinalKeyframe {
                        since: clocks.monotonic(),
                        cause: CloseReason::Shutdown,
                    };
                }
                State::WaitFinalKeyframe { .. } => {}
            }
        }

        let mut pkt = match input.next() {
            Ok(pkt) => pkt,
            Err(StreamError::Again) => {
                clocks.sleep(AGAIN_SLEEP);
                continue;
            }
            Err(StreamError::Eof) => break CloseReason::EndOfStream,
            Err(StreamError::Receive(e)) => {
                warn!("{}: packet read error: {}", req.label, e.chain());
                break CloseReason::PacketError;
            }
        };

        if pkt.track == Track::Audio && (!has_audio || state == State::WaitFirstKeyframe) {
            continue;
        }

        match state {
            State::WaitFirstKeyframe => {
                if pkt.track != Track::Video || !pkt.is_key {
                    continue;
                }
                debug!("{}: have first keyframe", req.label);
                state = State::Recording;
            }
            State::Recording => {
                if pkt.track == Track::Video
                    && clocks.monotonic().saturating_sub(start) >= req.max_duration
                {
                    if pkt.is_key {
                        // The keyframe is this segment's final packet; the
                        // next segment starts with the packet after it.
                        norm.normalize(&mut pkt);
                        if write_pkt(&mut mux, &pkt, req.label) {
                            video_packets += 1;
                            ended_on_keyframe = true;
                            break CloseReason::DurationReached;
                        }
                        break CloseReason::WriteError;
                    }
                    state = State::WaitFinalKeyframe {
                        since: clocks.monotonic(),
                        cause: CloseReason::DurationReached,
                    };
                }
            }
            State::WaitFinalKeyframe { since, cause } => {
                // A keyframe in hand always wins over the grace deadline,
                // even one that straggled in past it: the blocking read may
                // only notice the deadline when the keyframe arrives, and a
                // key-bracketed close is the better cut either way.
                if pkt.track == Track::Video && pkt.is_key {
                    norm.normalize(&mut pkt);
                    if write_pkt(&mut mux, &pkt, req.label) {
                        video_packets += 1;
                        ended_on_keyframe = true;
                        break cause;
                    }
                    break CloseReason::WriteError;
                }
                if clocks.monotonic().saturating_sub(since) >= FINAL_KEYFRAME_GRACE {
                    info!(
                        "{}: no keyframe within {:?}; closing on a non-key frame",
                        req.label, FINAL_KEYFRAME_GRACE
                    );
                    break cause;
                }
            }
        }

        norm.normalize(&mut pkt);
        let is_video = pkt.track == Track::Video;
        if !write_pkt(&mut mux, &pkt, req.label) {
            break CloseReason::WriteError;
        }
        if is_video {
            video_packets += 1;
        } else {
            audio_packets += 1;
        }
    };

    // Finalize whatever the muxer reached; a trailer failure downgrades to a
    // log line and size-only sealing by the recorder.
    let file = match mux.finish() {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("{}: failed to finalize {:?}: {}", req.label, req.output_path, e.chain());
            None
        }
    };

    continuity.segment_index += 1;
    continuity.last_frame_was_key = ended_on_keyframe;

    if close == CloseReason::EndOfStream {
        // The session is spent; force the next segment to reconnect.
        *session = None;
    }

    Ok(SegmentOutcome {
        close,
        video_packets,
        audio_packets,
        ended_on_keyframe,
        file,
    })
}

/// Writes one packet, reporting failure as a bool so the state machine can
/// close the segment short.
fn write_pkt<W: std::io::Write>(mux: &mut mp4::Fmp4Writer<W>, pkt: &stream::Packet, label: &str) -> bool {
    match mux.write(pkt) {
        Ok(()) => true,
        Err(e) => {
            warn!("{label}: mp4 write failed: {}", e.chain());
            false
        }
    }
}
