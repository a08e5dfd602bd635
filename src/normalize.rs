// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-track timestamp normalization.
//!
//! Input timestamps from a camera are arbitrary: they start anywhere, may
//! jump backwards, may exceed the 32-bit range a fragmented MP4 can address,
//! and often carry no useful duration. This module coerces every packet into
//! the contract the muxer needs:
//!
//! * DTS non-decreasing within a segment, per track;
//! * PTS ≥ DTS for every video packet;
//! * DTS and PTS within `[0, 2^31 - 1]`;
//! * segment N > 0 starts at 1 rather than inheriting segment N-1's last
//!   timestamp, so long sessions never grow toward the format limit.
//!
//! Nothing here fails; bad input is fixed up and at most warned about.

use tracing::{debug, warn};

use crate::stream::{AudioStreamInfo, Packet, Track, VideoStreamInfo};

/// Rebase when an output DTS would exceed this, well short of the real
/// `i32::MAX` fragment limit.
const OVERFLOW_GUARD: i64 = 0x7000_0000;

/// Output timestamps restart here after an overflow rebase, leaving room for
/// reordered packets slightly behind the rebase point.
const OVERFLOW_RESTART: i64 = 1000;

/// Durations above this are presumed garbage (a stalled camera clock or a
/// source that reports wall-clock gaps) and are capped.
const MAX_REASONABLE_DURATION: i64 = 10_000_000;

/// Cap value: one second in the 90 kHz video timebase.
const CAPPED_DURATION: i64 = 90_000;

/// Synthesizes a per-packet duration for a video track from its declared
/// frame rate, in timebase units. 1 if unusable.
pub fn default_video_duration(info: &VideoStreamInfo) -> i64 {
    match info.frame_rate {
        Some((num, den)) if num > 0 && den > 0 => {
            // fps = num/den, so one frame lasts timescale * den / num units.
            let d = i64::from(info.timescale) * i64::from(den) / i64::from(num);
            if d > 0 {
                d
            } else {
                1
            }
        }
        _ => 1,
    }
}

/// Synthesizes a per-packet duration for an audio track: samples per coded
/// frame, which in a timebase equal to the sample rate is the duration
/// directly. 1 if unknown.
pub fn default_audio_duration(info: &AudioStreamInfo) -> i64 {
    match info.frame_length {
        Some(n) if n > 0 => i64::from(n),
        _ => 1,
    }
}

struct TrackNormalizer {
    track: Track,

    /// Input-domain DTS subtracted from both DTS and PTS; lazily set from
    /// the first packet of the segment.
    base: Option<i64>,

    /// Added after rebasing: 0 for the session's first segment, 1 for
    /// continuation segments.
    offset: i64,

    /// Whether equal output DTS must be bumped (audio) or merely tolerated
    /// (video).
    strict_monotonic: bool,

    default_duration: i64,

    primed: bool,
    last_dts: i64,
}

impl TrackNormalizer {
    fn new(track: Track, segment_index: u32, default_duration: i64) -> Self {
        TrackNormalizer {
            track,
            base: None,
            offset: if segment_index == 0 { 0 } else { 1 },
            strict_monotonic: track == Track::Audio,
            default_duration,
            primed: false,
            last_dts: 0,
        }
    }

    fn normalize(&mut self, pkt: &mut Packet) {
        let in_dts = pkt.dts;
        let in_pts = pkt.pts;
        let base = *self.base.get_or_insert(in_dts);

        let mut dts = (in_dts - base + self.offset).max(0);
        let mut pts = (in_pts - base + self.offset).max(0);

        if self.primed {
            if self.strict_monotonic && dts <= self.last_dts {
                let bump = self.last_dts + 1 - dts;
                dts += bump;
                pts += bump;
            } else if dts < self.last_dts {
                debug!(
                    "{:?}: non-monotonic dts {dts} after {}; clamping",
                    self.track, self.last_dts
                );
                let bump = self.last_dts - dts;
                dts += bump;
                pts += bump;
            }
        }

        if pts < dts {
            warn!("{:?}: pts {pts} < dts {dts}; raising pts", self.track);
            pts = dts;
        }

        if dts > OVERFLOW_GUARD {
            warn!(
                "{:?}: output dts {dts} beyond 32-bit-safe range; restarting timestamps at {}",
                self.track, OVERFLOW_RESTART
            );
            self.base = Some(in_dts - OVERFLOW_RESTART);
            self.offset = 0;
            dts = OVERFLOW_RESTART;
            pts = OVERFLOW_RESTART + (in_pts - in_dts).max(0);
        }

        let mut duration = pkt.duration;
        if duration <= 0 {
            duration = self.default_duration;
        } else if duration > MAX_REASONABLE_DURATION {
            debug!(
                "{:?}: capping absurd duration {duration} to {CAPPED_DURATION}",
                self.track
            );
            duration = CAPPED_DURATION;
        }

        pkt.dts = dts;
        pkt.pts = pts;
        pkt.duration = duration;

        self.primed = true;
        self.last_dts = dts;
    }
}

/// Normalizer for one segment's packets, all tracks.
pub struct Normalizer {
    video: TrackNormalizer,
    audio: Option<TrackNormalizer>,
}

impl Normalizer {
    pub fn new(
        segment_index: u32,
        video: &VideoStreamInfo,
        audio: Option<&AudioStreamInfo>,
    ) -> Self {
        Normalizer {
            video: TrackNormalizer::new(
                Track::Video,
                segment_index,
                default_video_duration(video),
            ),
            audio: audio.map(|a| {
                TrackNormalizer::new(Track::Audio, segment_index, default_audio_duration(a))
            }),
        }
    }

    /// Rewrites the packet's dts/pts/duration in place.
    pub fn normalize(&mut self, pkt: &mut Packet) {
        match pkt.track {
            Track::Video => self.video.normalize(pkt),
            Track::Audio => {
                if let Some(a) = &mut self.audio {
                    a.normalize(pkt);
                }
            }
        }
    }
}
