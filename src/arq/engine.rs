//! Selective-repeat ARQ state machine.
//!
//! One [`Arq`] serves one conv id. It never touches a socket: inbound
//! datagrams are handed to [`ReliableSession::input`], outbound datagrams
//! accumulate until [`ReliableSession::take_output`].
//!
//! Sequence numbers and timestamps are u32 and compared in wrap-around
//! space.

use super::{ArqError, ReliableSession, Segment, SegmentKind, SEGMENT_HEADER_LEN};
use crate::config::{ReliableSessionConfig, MTU_MIN};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};

const RTO_NODELAY_MIN: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;

const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

#[inline]
fn diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// A segment that has been queued for transmission at least once
#[derive(Debug)]
struct InFlight {
    sn: u32,
    ts: u32,
    resend_at: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: Bytes,
}

/// Reliable session for one conv id
#[derive(Debug)]
pub struct Arq {
    conv: u32,
    mtu: usize,
    mss: usize,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    ssthresh: u32,
    incr: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    srtt: u32,
    rttval: u32,
    rto: u32,
    min_rto: u32,

    interval: u32,
    nodelay: bool,
    fast_resend: u32,
    congestion: bool,
    dead_link: u32,

    current: u32,
    ts_flush: u32,
    updated: bool,

    probe: u8,
    ts_probe: u32,
    probe_wait: u32,

    dead: bool,

    snd_queue: VecDeque<Bytes>,
    snd_buf: VecDeque<InFlight>,
    rcv_buf: BTreeMap<u32, Bytes>,
    rcv_queue: VecDeque<Bytes>,
    acks: Vec<(u32, u32)>,

    pending: BytesMut,
    output: Vec<Bytes>,
}

impl Arq {
    /// Create a configured session for `conv`.
    ///
    /// An MTU below [`MTU_MIN`] is raised to it; configs are expected to
    /// have passed [`ReliableSessionConfig::validate`].
    pub fn new(conv: u32, config: &ReliableSessionConfig) -> Self {
        let mtu = config.mtu.max(MTU_MIN);
        let rcv_wnd = u32::from(config.recv_window.max(1));
        Self {
            conv,
            mtu,
            mss: mtu - SEGMENT_HEADER_LEN,
            snd_wnd: u32::from(config.send_window.max(1)),
            rcv_wnd,
            rmt_wnd: rcv_wnd,
            cwnd: 1,
            ssthresh: THRESH_INIT,
            incr: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            srtt: 0,
            rttval: 0,
            rto: RTO_DEFAULT,
            min_rto: if config.nodelay { RTO_NODELAY_MIN } else { RTO_MIN },
            interval: config.interval.clamp(1, 5000),
            nodelay: config.nodelay,
            fast_resend: config.resend,
            congestion: !config.no_congestion,
            dead_link: config.dead_link.max(1),
            current: 0,
            ts_flush: 0,
            updated: false,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            dead: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: BTreeMap::new(),
            rcv_queue: VecDeque::new(),
            acks: Vec::new(),
            pending: BytesMut::with_capacity(mtu),
            output: Vec::new(),
        }
    }

    /// Maximum data bytes per segment
    pub fn mss(&self) -> usize {
        self.mss
    }

    fn window_unused(&self) -> u16 {
        let unused = self.rcv_wnd.saturating_sub(self.rcv_queue.len() as u32);
        unused.min(u32::from(u16::MAX)) as u16
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map_or(self.snd_nxt, |seg| seg.sn);
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if diff(una, front.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
        self.shrink_buf();
    }

    fn parse_ack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        if let Some(pos) = self.snd_buf.iter().position(|seg| seg.sn == sn) {
            self.snd_buf.remove(pos);
        }
        self.shrink_buf();
    }

    fn parse_fastack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, sn: u32, data: Bytes) {
        if diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || diff(sn, self.rcv_nxt) < 0 {
            return;
        }
        self.rcv_buf.entry(sn).or_insert(data);
        self.move_to_queue();
    }

    fn move_to_queue(&mut self) {
        while self.rcv_queue.len() < self.rcv_wnd as usize {
            match self.rcv_buf.remove(&self.rcv_nxt) {
                Some(data) => {
                    self.rcv_queue.push_back(data);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                }
                None => break,
            }
        }
    }

    /// Fold one RTT sample into the estimator. The sample comes from a
    /// peer-echoed timestamp, so it is capped at `RTO_MAX` first.
    fn update_rtt(&mut self, rtt: u32) {
        let rtt = rtt.min(RTO_MAX);
        if self.srtt == 0 {
            self.srtt = rtt.max(1);
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = self.rttval.saturating_mul(3).saturating_add(delta) / 4;
            self.srtt = (self.srtt.saturating_mul(7).saturating_add(rtt) / 8).max(1);
        }
        let rto = self
            .srtt
            .saturating_add(self.interval.max(self.rttval.saturating_mul(4)));
        self.rto = rto.clamp(self.min_rto, RTO_MAX);
    }

    fn grow_cwnd(&mut self) {
        let mss = self.mss;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + mss / 16;
            if (self.cwnd as usize + 1) * mss <= self.incr {
                self.cwnd += 1;
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd as usize * mss;
        }
    }

    fn emit(&mut self, segment: &Segment) {
        if !self.pending.is_empty() && self.pending.len() + segment.encoded_size() > self.mtu {
            self.output.push(self.pending.split().freeze());
        }
        segment.encode_into(&mut self.pending);
    }

    fn control(&self, kind: SegmentKind, sn: u32, ts: u32) -> Segment {
        Segment {
            conv: self.conv,
            kind,
            frg: 0,
            wnd: self.window_unused(),
            ts,
            sn,
            una: self.rcv_nxt,
            data: Bytes::new(),
        }
    }

    fn flush(&mut self) {
        let current = self.current;

        for (sn, ts) in std::mem::take(&mut self.acks) {
            let ack = self.control(SegmentKind::Ack, sn, ts);
            self.emit(&ack);
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if diff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            let ask = self.control(SegmentKind::WindowAsk, 0, current);
            self.emit(&ask);
        }
        if self.probe & ASK_TELL != 0 {
            let tell = self.control(SegmentKind::WindowTell, 0, current);
            self.emit(&tell);
        }
        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if self.congestion {
            cwnd = cwnd.min(self.cwnd);
        }

        while diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(data) = self.snd_queue.pop_front() else {
                break;
            };
            self.snd_buf.push_back(InFlight {
                sn: self.snd_nxt,
                ts: current,
                resend_at: current,
                rto: self.rto,
                fastack: 0,
                xmit: 0,
                data,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rto_min = if self.nodelay { 0 } else { self.rto >> 3 };
        let wnd = self.window_unused();
        let una = self.rcv_nxt;

        let mut lost = false;
        let mut change = false;
        let mut due = Vec::new();

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit = 1;
                seg.rto = self.rto;
                seg.resend_at = current.wrapping_add(seg.rto + rto_min);
            } else if diff(current, seg.resend_at) >= 0 {
                needsend = true;
                seg.xmit += 1;
                if self.nodelay {
                    seg.rto += seg.rto / 2;
                } else {
                    seg.rto += self.rto;
                }
                seg.rto = seg.rto.min(RTO_MAX);
                seg.resend_at = current.wrapping_add(seg.rto);
                lost = true;
            } else if seg.fastack >= resent {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resend_at = current.wrapping_add(seg.rto);
                change = true;
            }

            if needsend {
                seg.ts = current;
                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
                due.push(Segment {
                    conv: self.conv,
                    kind: SegmentKind::Push,
                    frg: 0,
                    wnd,
                    ts: seg.ts,
                    sn: seg.sn,
                    una,
                    data: seg.data.clone(),
                });
            }
        }

        for segment in &due {
            self.emit(segment);
        }
        if !self.pending.is_empty() {
            self.output.push(self.pending.split().freeze());
        }

        if self.congestion {
            if change {
                let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.ssthresh = (inflight / 2).max(THRESH_MIN);
                self.cwnd = self.ssthresh.saturating_add(resent);
                self.incr = self.cwnd as usize * self.mss;
            }
            if lost {
                self.ssthresh = (self.cwnd / 2).max(THRESH_MIN);
                self.cwnd = 1;
                self.incr = self.mss;
            }
            if self.cwnd < 1 {
                self.cwnd = 1;
                self.incr = self.mss;
            }
        }
    }
}

impl ReliableSession for Arq {
    fn conv(&self) -> u32 {
        self.conv
    }

    fn input(&mut self, datagram: &Bytes) -> Result<(), ArqError> {
        let segments = Segment::decode_all(self.conv, datagram)?;

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        for seg in segments {
            self.rmt_wnd = u32::from(seg.wnd);
            self.parse_una(seg.una);

            match seg.kind {
                SegmentKind::Ack => {
                    let rtt = diff(self.current, seg.ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt as u32);
                    }
                    self.parse_ack(seg.sn);
                    max_ack = match max_ack {
                        Some(max) if diff(seg.sn, max) <= 0 => Some(max),
                        _ => Some(seg.sn),
                    };
                }
                SegmentKind::Push => {
                    if diff(seg.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acks.push((seg.sn, seg.ts));
                        self.parse_data(seg.sn, seg.data);
                    }
                }
                SegmentKind::WindowAsk => self.probe |= ASK_TELL,
                SegmentKind::WindowTell => {}
            }
        }

        if let Some(max) = max_ack {
            self.parse_fastack(max);
        }

        if self.congestion && diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            self.grow_cwnd();
        }

        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> usize {
        let in_use = self.snd_queue.len() + self.snd_buf.len();
        let room = (self.snd_wnd as usize * 2).saturating_sub(in_use) * self.mss;
        let accepted = data.len().min(room);

        for chunk in data[..accepted].chunks(self.mss) {
            self.snd_queue.push_back(Bytes::copy_from_slice(chunk));
        }
        accepted
    }

    fn recv(&mut self, out: &mut BytesMut, limit: usize) -> usize {
        let was_full = self.rcv_queue.len() >= self.rcv_wnd as usize;
        let mut total = 0;

        while total < limit {
            let Some(front) = self.rcv_queue.front_mut() else {
                break;
            };
            let take = (limit - total).min(front.len());
            out.extend_from_slice(&front[..take]);
            total += take;
            if take == front.len() {
                self.rcv_queue.pop_front();
            } else {
                *front = front.slice(take..);
            }
        }

        self.move_to_queue();

        if was_full && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }
        total
    }

    fn update(&mut self, now: u32) {
        self.current = now;
        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }

        let mut slap = diff(now, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = now;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if diff(now, self.ts_flush) >= 0 {
                self.ts_flush = now.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    fn take_output(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.output)
    }

    fn waiting_to_send(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}
