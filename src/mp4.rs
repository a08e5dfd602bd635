// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fragmented `.mp4` writer.
//!
//! Output uses `empty_moov` semantics: a small `moov` with no sample tables
//! is written up front, and the samples follow in `moof`/`mdat` fragments
//! cut at GOP boundaries. Nothing is ever relocated within the file, so a
//! crash at any point loses at most the fragment being written plus the
//! optional trailing seek index (`mfra`), never previously written media.
//!
//! Codec parameters are copied verbatim: the sample entry bytes handed over
//! by the input layer land in `stsd` untouched.
//!
//! See ISO/IEC 14496-12 for the box definitions.

use std::io::Write;

use base::{err, Error};
use bytes::{BufMut, BytesMut};

use crate::stream::{AudioStreamInfo, Packet, Track, VideoStreamInfo};

/// Movie-level timescale for `mvhd`. Track timescales are per-track.
const MOVIE_TIMESCALE: u32 = 1000;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// `sample_depends_on` = 2: an I-frame.
const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000;
/// `sample_depends_on` = 1 plus `sample_is_non_sync_sample`.
const SAMPLE_FLAGS_NON_KEY: u32 = 0x0101_0000;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;

const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

#[derive(Copy, Clone, Debug)]
pub struct MuxOptions {
    /// Append an `mfra` seek index at finalization.
    pub write_seek_index: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        MuxOptions {
            write_seek_index: true,
        }
    }
}

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        {
            $b;
        }
        let len = $buf.len() - pos_start;
        let len = u32::try_from(len).map_err(|_| err!(OutOfRange, msg("box too large")))?;
        $buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes()[..]);
    }};
}

struct Sample {
    duration: u32,
    size: u32,
    is_key: bool,
    cts_offset: i32,
}

struct TrakState {
    track_id: u32,
    timescale: u32,
    is_video: bool,
    sample_entry: Vec<u8>,
    width: u16,
    height: u16,

    // Pending (unflushed) fragment.
    samples: Vec<Sample>,
    data: Vec<u8>,
    fragment_dts: u64,
}

impl TrakState {
    fn new(track_id: u32, timescale: u32, is_video: bool, sample_entry: Vec<u8>) -> Self {
        TrakState {
            track_id,
            timescale,
            is_video,
            sample_entry,
            width: 0,
            height: 0,
            samples: Vec::new(),
            data: Vec::new(),
            fragment_dts: 0,
        }
    }

    fn push(&mut self, pkt: &Packet) -> Result<(), Error> {
        if self.samples.is_empty() {
            self.fragment_dts = u64::try_from(pkt.dts)
                .map_err(|_| err!(OutOfRange, msg("negative dts {} reached muxer", pkt.dts)))?;
        }
        self.samples.push(Sample {
            duration: u32::try_from(pkt.duration)
                .map_err(|_| err!(OutOfRange, msg("bad duration {}", pkt.duration)))?,
            size: u32::try_from(pkt.data.len())
                .map_err(|_| err!(OutOfRange, msg("oversized sample")))?,
            is_key: pkt.is_key,
            cts_offset: i32::try_from(pkt.pts - pkt.dts)
                .map_err(|_| err!(OutOfRange, msg("bad cts offset")))?,
        });
        self.data.extend_from_slice(&pkt.data);
        Ok(())
    }

    fn clear_fragment(&mut self) {
        self.samples.clear();
        self.data.clear();
    }

    fn write_trak(&self, buf: &mut BytesMut) -> Result<(), Error> {
        write_box!(buf, b"trak", {
            write_box!(buf, b"tkhd", {
                buf.put_u32((1 << 24) | 7); // version 1, enabled | in-movie | in-preview
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(self.track_id);
                buf.put_u32(0); // reserved
                buf.put_u64(0); // duration: unknown (fragments supply it)
                buf.put_u64(0); // reserved
                buf.put_u16(0); // layer
                buf.put_u16(0); // alternate_group
                buf.put_u16(if self.is_video { 0 } else { 0x0100 }); // volume
                buf.put_u16(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                buf.put_u32(u32::from(self.width) << 16);
                buf.put_u32(u32::from(self.height) << 16);
            });
            write_box!(buf, b"mdia", {
                write_box!(buf, b"mdhd", {
                    buf.put_u32(1 << 24); // version 1
                    buf.put_u64(0); // creation_time
                    buf.put_u64(0); // modification_time
                    buf.put_u32(self.timescale);
                    buf.put_u64(0); // duration: unknown
                    buf.put_u32(0x55c4_0000); // language=und + pre_defined
                });
                write_box!(buf, b"hdlr", {
                    buf.put_u32(0); // version + flags
                    buf.put_u32(0); // pre_defined
                    buf.extend_from_slice(if self.is_video { b"vide" } else { b"soun" });
                    buf.put_u32(0); // reserved[0]
                    buf.put_u32(0); // reserved[1]
                    buf.put_u32(0); // reserved[2]
                    buf.put_u8(0); // name, zero-terminated (empty)
                });
                write_box!(buf, b"minf", {
                    if self.is_video {
                        write_box!(buf, b"vmhd", {
                            buf.put_u32(1); // version + flags
                            buf.put_u64(0); // graphicsmode + opcolor
                        });
                    } else {
                        write_box!(buf, b"smhd", {
                            buf.put_u32(0); // version + flags
                            buf.put_u32(0); // balance + reserved
                        });
                    }
                    write_box!(buf, b"dinf", {
                        write_box!(buf, b"dref", {
                            buf.put_u32(0); // version + flags
                            buf.put_u32(1); // entry_count
                            write_box!(buf, b"url ", {
                                buf.put_u32(1); // version + flags: self-contained
                            });
                        });
                    });
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version + flags
                            buf.put_u32(1); // entry_count
                            buf.extend_from_slice(&self.sample_entry);
                        });
                        // Empty sample tables; all samples live in fragments.
                        write_box!(buf, b"stts", {
                            buf.put_u32(0);
                            buf.put_u32(0); // entry_count
                        });
                        write_box!(buf, b"stsc", {
                            buf.put_u32(0);
                            buf.put_u32(0); // entry_count
                        });
                        write_box!(buf, b"stsz", {
                            buf.put_u32(0);
                            buf.put_u32(0); // sample_size
                            buf.put_u32(0); // sample_count
                        });
                        write_box!(buf, b"stco", {
                            buf.put_u32(0);
                            buf.put_u32(0); // entry_count
                        });
                    });
                });
            });
        });
        Ok(())
    }

    /// Writes `traf` for the pending fragment. Returns the moof-relative
    /// position of the `trun` data_offset field, for patching once the moof
    /// size is known.
    fn write_traf(&self, buf: &mut BytesMut) -> Result<usize, Error> {
        let mut data_offset_pos = 0;
        write_box!(buf, b"traf", {
            write_box!(buf, b"tfhd", {
                buf.put_u32(TFHD_DEFAULT_BASE_IS_MOOF);
                buf.put_u32(self.track_id);
            });
            write_box!(buf, b"tfdt", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(self.fragment_dts);
            });
            write_box!(buf, b"trun", {
                let mut flags = TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE;
                if self.is_video {
                    flags |= TRUN_SAMPLE_FLAGS | TRUN_SAMPLE_CTS;
                }
                buf.put_u32((1 << 24) | flags); // version 1: signed cts offsets
                buf.put_u32(u32::try_from(self.samples.len()).expect("fragment fits u32"));
                data_offset_pos = buf.len();
                buf.put_i32(0); // patched later
                for s in &self.samples {
                    buf.put_u32(s.duration);
                    buf.put_u32(s.size);
                    if self.is_video {
                        buf.put_u32(if s.is_key {
                            SAMPLE_FLAGS_KEY
                        } else {
                            SAMPLE_FLAGS_NON_KEY
                        });
                        buf.put_i32(s.cts_offset);
                    }
                }
            });
        });
        Ok(data_offset_pos)
    }
}

/// One finished file's vital statistics.
#[derive(Clone, Debug)]
pub struct FinishedFile {
    pub bytes: u64,
    pub fragments: u32,
}

/// Writes fragmented `.mp4` data to a sink.
/// See module-level documentation for details.
pub struct Fmp4Writer<W: Write> {
    inner: W,
    pos: u64,
    video: TrakState,
    audio: Option<TrakState>,
    seq: u32,

    /// `(tfdt time, moof byte offset)` of each written fragment, for `mfra`.
    fragment_index: Vec<(u64, u64)>,
    options: MuxOptions,
}

impl<W: Write> Fmp4Writer<W> {
    /// Creates the writer and emits the file header (`ftyp` + `moov`).
    pub fn new(
        inner: W,
        video: &VideoStreamInfo,
        audio: Option<&AudioStreamInfo>,
        options: MuxOptions,
    ) -> Result<Self, Error> {
        let mut video_trak = TrakState::new(
            VIDEO_TRACK_ID,
            video.timescale,
            true,
            video.sample_entry.clone(),
        );
        video_trak.width = video.width;
        video_trak.height = video.height;
        let audio_trak = audio.map(|a| {
            TrakState::new(AUDIO_TRACK_ID, a.sample_rate, false, a.sample_entry.clone())
        });
        let mut w = Fmp4Writer {
            inner,
            pos: 0,
            video: video_trak,
            audio: audio_trak,
            seq: 1,
            fragment_index: Vec::new(),
            options,
        };
        w.write_header()?;
        Ok(w)
    }

    fn put(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(
            1024 + self.video.sample_entry.len()
                + self.audio.as_ref().map(|a| a.sample_entry.len()).unwrap_or(0),
        );
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom"); // major_brand
            buf.put_u32(0x200); // minor_version
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso6");
            buf.extend_from_slice(b"avc1");
            buf.extend_from_slice(b"mp41");
        });
        write_box!(&mut buf, b"moov", {
            write_box!(&mut buf, b"mvhd", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(MOVIE_TIMESCALE);
                buf.put_u64(0); // duration: grows fragment by fragment
                buf.put_u32(0x00010000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(if self.audio.is_some() {
                    AUDIO_TRACK_ID + 1
                } else {
                    VIDEO_TRACK_ID + 1
                }); // next_track_id
            });
            self.video.write_trak(&mut buf)?;
            if let Some(a) = &self.audio {
                a.write_trak(&mut buf)?;
            }
            write_box!(&mut buf, b"mvex", {
                write_box!(&mut buf, b"trex", {
                    buf.put_u32(0); // version + flags
                    buf.put_u32(VIDEO_TRACK_ID);
                    buf.put_u32(1); // default_sample_description_index
                    buf.put_u32(0); // default_sample_duration
                    buf.put_u32(0); // default_sample_size
                    buf.put_u32(SAMPLE_FLAGS_NON_KEY); // default_sample_flags
                });
                if self.audio.is_some() {
                    write_box!(&mut buf, b"trex", {
                        buf.put_u32(0);
                        buf.put_u32(AUDIO_TRACK_ID);
                        buf.put_u32(1);
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(0);
                    });
                }
            });
        });
        self.put(&buf)
    }

    /// Buffers one normalized packet. Video keyframes cut a new fragment, so
    /// each flushed fragment covers at most one GOP.
    pub fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        if pkt.track == Track::Video && pkt.is_key && !self.video.samples.is_empty() {
            self.flush_fragment()?;
        }
        match pkt.track {
            Track::Video => self.video.push(pkt),
            Track::Audio => self
                .audio
                .as_mut()
                .ok_or_else(|| err!(FailedPrecondition, msg("no audio track in this file")))?
                .push(pkt),
        }
    }

    /// Writes the pending fragment, if any.
    pub fn flush_fragment(&mut self) -> Result<(), Error> {
        let video_samples = !self.video.samples.is_empty();
        let audio_samples = self.audio.as_ref().is_some_and(|a| !a.samples.is_empty());
        if !video_samples && !audio_samples {
            return Ok(());
        }
        let moof_offset = self.pos;
        let mut buf = BytesMut::with_capacity(
            256 + 16 * self.video.samples.len()
                + 8 * self.audio.as_ref().map(|a| a.samples.len()).unwrap_or(0),
        );
        let mut video_data_offset_pos = None;
        let mut audio_data_offset_pos = None;
        write_box!(&mut buf, b"moof", {
            write_box!(&mut buf, b"mfhd", {
                buf.put_u32(0); // version + flags
                buf.put_u32(self.seq);
            });
            if video_samples {
                video_data_offset_pos = Some(self.video.write_traf(&mut buf)?);
            }
            if audio_samples {
                if let Some(a) = &self.audio {
                    audio_data_offset_pos = Some(a.write_traf(&mut buf)?);
                }
            }
        });

        // Patch trun data offsets now that the moof size is known; sample
        // data starts just past the mdat header, video first.
        let base = i32::try_from(buf.len() + 8)
            .map_err(|_| err!(OutOfRange, msg("moof too large")))?;
        if let Some(pos) = video_data_offset_pos {
            buf[pos..pos + 4].copy_from_slice(&base.to_be_bytes());
        }
        if let Some(pos) = audio_data_offset_pos {
            let off = base
                .checked_add(i32::try_from(self.video.data.len()).unwrap_or(i32::MAX))
                .ok_or_else(|| err!(OutOfRange, msg("fragment too large")))?;
            buf[pos..pos + 4].copy_from_slice(&off.to_be_bytes());
        }

        let payload_len = self.video.data.len()
            + self.audio.as_ref().map(|a| a.data.len()).unwrap_or(0);
        let mdat_len = u32::try_from(payload_len + 8)
            .map_err(|_| err!(OutOfRange, msg("fragment too large")))?;
        buf.put_u32(mdat_len);
        buf.extend_from_slice(b"mdat");

        let tfdt = if video_samples {
            self.video.fragment_dts
        } else {
            self.audio.as_ref().map(|a| a.fragment_dts).unwrap_or(0)
        };

        self.put(&buf.split().freeze())?;
        if !self.video.data.is_empty() {
            let data = std::mem::take(&mut self.video.data);
            self.put(&data)?;
        }
        if let Some(a) = &mut self.audio {
            if !a.data.is_empty() {
                let data = std::mem::take(&mut a.data);
                self.put(&data)?;
            }
        }

        self.fragment_index.push((tfdt, moof_offset));
        self.seq = self.seq.wrapping_add(1);
        self.video.clear_fragment();
        if let Some(a) = &mut self.audio {
            a.clear_fragment();
        }
        Ok(())
    }

    fn write_seek_index(&mut self) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(64 + 19 * self.fragment_index.len());
        write_box!(&mut buf, b"mfra", {
            write_box!(&mut buf, b"tfra", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u32(VIDEO_TRACK_ID);
                buf.put_u32(0); // traf/trun/sample number lengths: 1 byte each
                buf.put_u32(u32::try_from(self.fragment_index.len()).expect("index fits u32"));
                for (time, moof_offset) in &self.fragment_index {
                    buf.put_u64(*time);
                    buf.put_u64(*moof_offset);
                    buf.put_u8(1); // traf_number
                    buf.put_u8(1); // trun_number
                    buf.put_u8(1); // sample_number
                }
            });
            write_box!(&mut buf, b"mfro", {
                buf.put_u32(0); // version + flags
                buf.put_u32(0); // patched below: size of the whole mfra
            });
        });
        let total = u32::try_from(buf.len())
            .map_err(|_| err!(OutOfRange, msg("seek index too large")))?;
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&total.to_be_bytes());
        self.put(&buf)
    }

    /// Flushes pending samples and finalizes the file.
    ///
    /// Everything before this call is already durable on its own; `finish`
    /// only appends (the final fragment and, if configured, the seek index).
    pub fn finish(mut self) -> Result<FinishedFile, Error> {
        self.flush_fragment()?;
        let fragments = u32::try_from(self.fragment_index.len()).unwrap_or(u32::MAX);
        if self.options.write_seek_index && !self.fragment_index.is_empty() {
            self.write_seek_index()?;
        }
        self.inner.flush()?;
        Ok(FinishedFile {
            bytes: self.pos,
            fragments,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::stream::testutil::{test_audio_info, test_video_info};
    use bytes::Bytes;

    fn pkt(track: Track, dts: i64, duration: i64, is_key: bool, len: usize) -> Packet {
        Packet {
            track,
            dts,
            pts: dts,
            duration,
            is_key,
            data: Bytes::from(vec![0xABu8; len]),
        }
    }

    fn new_writer(audio: bool, options: MuxOptions) -> Fmp4Writer<Vec<u8>> {
        let v = test_video_info();
        let a = test_audio_info();
        Fmp4Writer::new(Vec::new(), &v, audio.then_some(&a), options).unwrap()
    }

    #[test]
    fn finish_reports_stats() {
        let w = new_writer(true, MuxOptions::default());
        let f = w.finish().unwrap();
        assert_eq!(f.fragments, 0);
        assert!(f.bytes > 0);

        let mut w = new_writer(true, MuxOptions::default());
        w.write(&pkt(Track::Video, 0, 3000, true, 10)).unwrap();
        w.write(&pkt(Track::Video, 3000, 3000, true, 10)).unwrap();
        let f = w.finish().unwrap();
        assert_eq!(f.fragments, 2);
    }

    /// Runs `f` against a writer and returns the written bytes.
    fn write_to_vec(
        audio: bool,
        options: MuxOptions,
        f: impl FnOnce(&mut Fmp4Writer<SharedVec>),
    ) -> Vec<u8> {
        let out = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let v = test_video_info();
        let a = test_audio_info();
        let mut w = Fmp4Writer::new(
            SharedVec(out.clone()),
            &v,
            audio.then_some(&a),
            options,
        )
        .unwrap();
        f(&mut w);
        w.finish().unwrap();
        std::rc::Rc::try_unwrap(out).unwrap().into_inner()
    }

    struct SharedVec(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl std::io::Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn moov_structure() {
        let buf = write_to_vec(true, MuxOptions::default(), |_| {});
        let top = top_level(&buf);
        assert_eq!(
            top.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["ftyp", "moov"]
        );
        let moov = top[1].1.clone();
        assert_eq!(names(&buf, moov.clone()), vec!["mvhd", "trak", "trak", "mvex"]);
        let mvex = child(&buf, moov.clone(), "mvex");
        assert_eq!(names(&buf, mvex), vec!["trex", "trex"]);

        // Video trak carries the sample entry verbatim.
        let trak = boxes(&buf, moov)
            .into_iter()
            .find(|(n, _)| n == "trak")
            .unwrap()
            .1;
        let mdia = child(&buf, trak, "mdia");
        let minf = child(&buf, mdia, "minf");
        let stbl = child(&buf, minf, "stbl");
        let stsd = child(&buf, stbl, "stsd");
        let entry = test_video_info().sample_entry;
        assert_eq!(&buf[stsd.start + 8..stsd.end], &entry[..]);
    }

    #[test]
    fn video_only_moov_has_one_trak() {
        let buf = write_to_vec(false, MuxOptions::default(), |_| {});
        let top = top_level(&buf);
        let moov = top[1].1.clone();
        assert_eq!(names(&buf, moov), vec!["mvhd", "trak", "mvex"]);
    }

    #[test]
    fn single_gop_fragment() {
        let buf = write_to_vec(false, MuxOptions { write_seek_index: false }, |w| {
            w.write(&pkt(Track::Video, 10, 3000, true, 100)).unwrap();
            w.write(&pkt(Track::Video, 3010, 3000, false, 50)).unwrap();
            w.write(&pkt(Track::Video, 6010, 3000, false, 50)).unwrap();
        });
        let top = top_level(&buf);
        assert_eq!(
            top.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["ftyp", "moov", "moof", "mdat"]
        );
        let (moof_payload, mdat_payload) = (top[2].1.clone(), top[3].1.clone());
        let moof_start = moof_payload.start - 8;
        assert_eq!(names(&buf, moof_payload.clone()), vec!["mfhd", "traf"]);
        let traf = child(&buf, moof_payload, "traf");
        assert_eq!(names(&buf, traf.clone()), vec!["tfhd", "tfdt", "trun"]);

        let tfdt = child(&buf, traf.clone(), "tfdt");
        assert_eq!(be_u32(&buf, tfdt.start), 1 << 24);
        assert_eq!(be_u64(&buf, tfdt.start + 4), 10);

        let trun = child(&buf, traf, "trun");
        let flags = be_u32(&buf, trun.start) & 0x00ff_ffff;
        assert_eq!(
            flags,
            TRUN_DATA_OFFSET
                | TRUN_SAMPLE_DURATION
                | TRUN_SAMPLE_SIZE
                | TRUN_SAMPLE_FLAGS
                | TRUN_SAMPLE_CTS
        );
        let sample_count = be_u32(&buf, trun.start + 4);
        assert_eq!(sample_count, 3);
        let data_offset = be_u32(&buf, trun.start + 8) as usize;
        assert_eq!(moof_start + data_offset, mdat_payload.start);

        // First sample: duration, size, key flags.
        assert_eq!(be_u32(&buf, trun.start + 12), 3000);
        assert_eq!(be_u32(&buf, trun.start + 16), 100);
        assert_eq!(be_u32(&buf, trun.start + 20), SAMPLE_FLAGS_KEY);
        // Second sample is non-key.
        assert_eq!(be_u32(&buf, trun.start + 36), SAMPLE_FLAGS_NON_KEY);
        assert_eq!(mdat_payload.len(), 200);
    }

    #[test]
    fn fragment_cut_per_gop() {
        let buf = write_to_vec(false, MuxOptions { write_seek_index: false }, |w| {
            w.write(&pkt(Track::Video, 0, 3000, true, 10)).unwrap();
            w.write(&pkt(Track::Video, 3000, 3000, false, 10)).unwrap();
            w.write(&pkt(Track::Video, 6000, 3000, true, 10)).unwrap();
            w.write(&pkt(Track::Video, 9000, 3000, false, 10)).unwrap();
        });
        let top = top_level(&buf);
        assert_eq!(
            top.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["ftyp", "moov", "moof", "mdat", "moof", "mdat"]
        );
        let second_moof = top[4].1.clone();
        let traf = child(&buf, second_moof, "traf");
        let tfdt = child(&buf, traf, "tfdt");
        assert_eq!(be_u64(&buf, tfdt.start + 4), 6000);
        // Sequence numbers advance.
        let mfhd2 = child(&buf, top[4].1.clone(), "mfhd");
        assert_eq!(be_u32(&buf, mfhd2.start + 4), 2);
    }

    #[test]
    fn interleaved_audio_shares_fragment() {
        let buf = write_to_vec(true, MuxOptions { write_seek_index: false }, |w| {
            w.write(&pkt(Track::Video, 0, 3000, true, 100)).unwrap();
            w.write(&pkt(Track::Audio, 0, 1024, false, 20)).unwrap();
            w.write(&pkt(Track::Audio, 1024, 1024, false, 20)).unwrap();
            w.write(&pkt(Track::Video, 3000, 3000, false, 100)).unwrap();
        });
        let top = top_level(&buf);
        assert_eq!(
            top.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["ftyp", "moov", "moof", "mdat"]
        );
        let moof = top[2].1.clone();
        let moof_start = moof.start - 8;
        let trafs: Vec<_> = boxes(&buf, moof)
            .into_iter()
            .filter(|(n, _)| n == "traf")
            .collect();
        assert_eq!(trafs.len(), 2);

        // mdat payload: video bytes then audio bytes.
        let mdat = top[3].1.clone();
        assert_eq!(mdat.len(), 240);
        let video_trun = child(&buf, trafs[0].1.clone(), "trun");
        let audio_trun = child(&buf, trafs[1].1.clone(), "trun");
        let video_off = be_u32(&buf, video_trun.start + 8) as usize;
        let audio_off = be_u32(&buf, audio_trun.start + 8) as usize;
        assert_eq!(moof_start + video_off, mdat.start);
        assert_eq!(moof_start + audio_off, mdat.start + 200);

        // Audio trun carries durations and sizes but no per-sample flags.
        let audio_flags = be_u32(&buf, audio_trun.start) & 0x00ff_ffff;
        assert_eq!(
            audio_flags,
            TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE
        );
        assert_eq!(be_u32(&buf, audio_trun.start + 4), 2); // sample_count
    }

    #[test]
    fn seek_index_references_every_fragment() {
        let buf = write_to_vec(false, MuxOptions::default(), |w| {
            w.write(&pkt(Track::Video, 0, 3000, true, 10)).unwrap();
            w.write(&pkt(Track::Video, 3000, 3000, true, 10)).unwrap();
        });
        let top = top_level(&buf);
        assert_eq!(
            top.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["ftyp", "moov", "moof", "mdat", "moof", "mdat", "mfra"]
        );
        let mfra = top[6].1.clone();
        let mfra_box_len = mfra.len() + 8;
        let tfra = child(&buf, mfra.clone(), "tfra");
        assert_eq!(be_u32(&buf, tfra.start + 4), VIDEO_TRACK_ID);
        let entry_count = be_u32(&buf, tfra.start + 12);
        assert_eq!(entry_count, 2);
        // First entry points at the first moof.
        assert_eq!(be_u64(&buf, tfra.start + 16), 0); // time
        assert_eq!(be_u64(&buf, tfra.start + 24) as usize, top[2].1.start - 8);
        // Second entry.
        assert_eq!(be_u64(&buf, tfra.start + 16 + 19), 3000);
        assert_eq!(
            be_u64(&buf, tfra.start + 24 + 19) as usize,
            top[4].1.start - 8
        );
        let mfro = child(&buf, mfra, "mfro");
        assert_eq!(be_u32(&buf, mfro.start + 4) as usize, mfra_box_len);
    }

    #[test]
    fn seek_index_disabled() {
        let buf = write_to_vec(false, MuxOptions { write_seek_index: false }, |w| {
            w.write(&pkt(Track::Video, 0, 3000, true, 10)).unwrap();
        });
        let top = top_level(&buf);
        assert!(top.iter().all(|(n, _)| n != "mfra"));
    }

    #[test]
    fn audio_packet_without_audio_track_rejected() {
        let mut w = new_writer(false, MuxOptions::default());
        w.write(&pkt(Track::Audio, 0, 1024, false, 10)).unwrap_err();
    }
}
