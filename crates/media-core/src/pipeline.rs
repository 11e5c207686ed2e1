//! SRTP media pipeline over a secured datagram path
//!
//! The pipeline owns every stream of a session. Outbound frames are
//! packetized, protected and written to the transport; inbound datagrams
//! are unprotected and routed to their stream by SSRC. A report timer sends
//! RTCP sender/receiver reports plus a REMB estimate and feeds received
//! reports into the congestion controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use rtp_core::packet::is_rtcp_packet;
use rtp_core::{
    DatagramTransport, NtpTimestamp, RtcpPacket, RtcpReceiverReport, RtcpRemb, RtcpReportBlock,
    RtpPacket, RtpSsrc, RttEstimator, SrtpSession,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::congestion::{CongestionController, IncomingBitrateEstimator, LossReport};
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::events::{MediaEvent, MediaStats};
use crate::packetizer::MediaFrame;
use crate::stream::{MediaStream, StreamConfig};

struct PipelineState {
    streams: Vec<MediaStream>,
    congestion: CongestionController,
    incoming: IncomingBitrateEstimator,
    rtt: RttEstimator,
    srtp_rejected: u64,
    rtcp_reports_sent: u64,
    /// SSRC used for RTCP when no stream sends
    rtcp_ssrc: RtpSsrc,
}

impl PipelineState {
    fn stats(&self) -> MediaStats {
        MediaStats {
            streams: self.streams.iter().map(MediaStream::stats).collect(),
            target_bitrate_bps: self.congestion.target_bitrate(),
            remote_estimate_bps: self.congestion.remote_estimate(),
            rtt_ms: self.rtt.rtt().map(|rtt| rtt.as_secs_f64() * 1000.0),
            srtp_rejected: self.srtp_rejected,
            rtcp_reports_sent: self.rtcp_reports_sent,
        }
    }

    fn is_local_ssrc(&self, ssrc: RtpSsrc) -> bool {
        self.streams.iter().any(|s| s.local_ssrc() == ssrc)
    }
}

/// Media pipeline of one session
pub struct MediaPipeline {
    config: MediaConfig,
    state: Mutex<PipelineState>,
    srtp: Mutex<SrtpSession>,
    transport: Arc<dyn DatagramTransport>,
    events: mpsc::UnboundedSender<MediaEvent>,
    stopped: AtomicBool,
}

impl MediaPipeline {
    /// Build a pipeline for the negotiated streams
    pub fn new(
        config: MediaConfig,
        srtp: SrtpSession,
        transport: Arc<dyn DatagramTransport>,
        streams: Vec<StreamConfig>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<MediaEvent>)> {
        config.validate()?;
        let streams = streams
            .into_iter()
            .map(|stream| MediaStream::new(stream, &config))
            .collect::<Result<Vec<_>>>()?;
        let rtcp_ssrc = streams
            .first()
            .map(MediaStream::local_ssrc)
            .unwrap_or_else(rand::random);

        let state = PipelineState {
            streams,
            congestion: CongestionController::from_config(&config),
            incoming: IncomingBitrateEstimator::new(config.min_bitrate_bps, config.max_bitrate_bps),
            rtt: RttEstimator::new(),
            srtp_rejected: 0,
            rtcp_reports_sent: 0,
            rtcp_ssrc,
        };

        let (events, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            config,
            state: Mutex::new(state),
            srtp: Mutex::new(srtp),
            transport,
            events,
            stopped: AtomicBool::new(false),
        });
        Ok((pipeline, rx))
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Current send target of the congestion controller
    pub fn target_bitrate(&self) -> u64 {
        self.state.lock().congestion.target_bitrate()
    }

    pub fn stats(&self) -> MediaStats {
        self.state.lock().stats()
    }

    /// Whether `run` has returned
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Local SSRCs of the streams that may send
    pub fn sending_ssrcs(&self) -> Vec<RtpSsrc> {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|s| s.config().send)
            .map(MediaStream::local_ssrc)
            .collect()
    }

    /// Replace the stream set after a renegotiation. Streams are matched by
    /// mid; missing ones are removed and new ones created.
    pub fn update_streams(&self, configs: Vec<StreamConfig>) -> Result<Vec<RtpSsrc>> {
        let mut state = self.state.lock();
        let mut previous = std::mem::take(&mut state.streams);
        let mut streams = Vec::with_capacity(configs.len());

        for config in configs {
            match previous.iter().position(|s| s.mid() == config.mid) {
                Some(index) => {
                    let mut stream = previous.swap_remove(index);
                    stream.reconfigure(config)?;
                    streams.push(stream);
                }
                None => streams.push(MediaStream::new(config, &self.config)?),
            }
        }

        let removed: Vec<RtpSsrc> = previous.iter().map(MediaStream::local_ssrc).collect();
        if !removed.is_empty() {
            info!("Removed {} streams by renegotiation", removed.len());
        }
        state.streams = streams;
        Ok(removed)
    }

    /// Packetize, protect and send a frame on the stream with this local
    /// SSRC. Returns the number of packets written.
    pub async fn send_frame(&self, ssrc: RtpSsrc, frame: MediaFrame) -> Result<usize> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let packets = {
            let mut state = self.state.lock();
            let stream = state
                .streams
                .iter_mut()
                .find(|s| s.local_ssrc() == ssrc)
                .ok_or(Error::UnknownStream(ssrc))?;
            stream.packetize(&frame, Instant::now())?
        };

        let datagrams = {
            let mut srtp = self.srtp.lock();
            packets
                .iter()
                .map(|packet| {
                    let plain = packet.serialize()?;
                    Ok(srtp.protect_rtp(&plain)?)
                })
                .collect::<Result<Vec<Bytes>>>()?
        };

        for datagram in &datagrams {
            self.transport
                .send(datagram)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        trace!(ssrc, packets = datagrams.len(), "Sent frame");
        Ok(datagrams.len())
    }

    /// Process one inbound RTP or SRTCP datagram
    pub fn handle_datagram(&self, data: &[u8]) -> Result<()> {
        if !data.first().map_or(false, |b| (128..=191).contains(b)) {
            return Err(Error::InvalidParameter("Not an RTP or RTCP datagram".into()));
        }

        let result = if is_rtcp_packet(data) {
            self.handle_rtcp(data)
        } else {
            self.handle_rtp(data)
        };
        if let Err(e) = &result {
            if e.is_packet_rejection() {
                self.state.lock().srtp_rejected += 1;
            }
        }
        result
    }

    fn handle_rtp(&self, data: &[u8]) -> Result<()> {
        let plain = self.srtp.lock().unprotect_rtp(data)?;
        let packet = RtpPacket::parse(&plain)?;
        let ssrc = packet.header.ssrc;
        let arrival = Instant::now();

        let mut state = self.state.lock();
        state.incoming.on_packet(packet.payload.len(), arrival);
        let stream = state
            .streams
            .iter_mut()
            .find(|s| s.accepts(ssrc, packet.header.payload_type))
            .ok_or(Error::UnknownStream(ssrc))?;

        let outcome = stream.receive(packet, arrival);
        drop(state);

        if let Some((sequence_number, total)) = outcome.late {
            debug!(ssrc, sequence_number, total, "Late packet discarded");
            self.emit(MediaEvent::LatePacketDiscarded {
                ssrc,
                sequence_number,
                total,
            });
        }
        for frame in outcome.frames {
            self.emit(MediaEvent::FrameReceived { ssrc, frame });
        }
        Ok(())
    }

    fn handle_rtcp(&self, data: &[u8]) -> Result<()> {
        let plain = self.srtp.lock().unprotect_rtcp(data)?;
        let packets = RtcpPacket::parse_compound(&plain)?;
        let arrival = Instant::now();
        let arrival_ntp = NtpTimestamp::now();

        let mut changes = Vec::new();
        let mut state = self.state.lock();
        for packet in packets {
            let blocks = match packet {
                RtcpPacket::SenderReport(report) => {
                    for stream in state.streams.iter_mut() {
                        stream.on_sender_report(&report, arrival);
                    }
                    report.report_blocks
                }
                RtcpPacket::ReceiverReport(report) => report.report_blocks,
                RtcpPacket::Remb(remb) => {
                    trace!(bps = remb.bitrate_bps, "Received REMB");
                    changes.extend(state.congestion.on_remote_estimate(remb.bitrate_bps));
                    continue;
                }
            };

            if let Some(report) = Self::loss_report(&mut state, &blocks, arrival_ntp) {
                changes.extend(state.congestion.on_loss_report(report));
            }
        }
        drop(state);

        for bps in changes {
            self.emit(MediaEvent::TargetBitrateChanged { bps });
        }
        Ok(())
    }

    /// Worst loss and the RTT sample across the blocks about our streams
    fn loss_report(
        state: &mut PipelineState,
        blocks: &[RtcpReportBlock],
        arrival: NtpTimestamp,
    ) -> Option<LossReport> {
        let mut report: Option<LossReport> = None;
        let local: Vec<&RtcpReportBlock> = blocks.iter().filter(|b| state.is_local_ssrc(b.ssrc)).collect();
        for block in local {
            let sample = state.rtt.on_report_block(block, arrival);
            let entry = report.get_or_insert_with(LossReport::default);
            entry.fraction_lost = entry.fraction_lost.max(block.loss_ratio());
            if sample.is_some() {
                entry.rtt = sample;
            }
        }
        report
    }

    /// Send one round of RTCP reports and publish statistics
    pub async fn send_reports(&self) -> Result<()> {
        let now = Instant::now();
        let ntp = NtpTimestamp::now();

        let (compound, stats) = {
            let mut state = self.state.lock();
            let blocks: Vec<RtcpReportBlock> = state
                .streams
                .iter_mut()
                .filter_map(|s| s.report_block(now))
                .collect();
            let worst_loss = blocks.iter().map(RtcpReportBlock::loss_ratio).fold(0.0, f64::max);

            let mut packets = Vec::new();
            let mut pending_blocks = Some(blocks.clone());
            for stream in &state.streams {
                if let Some(mut report) = stream.sender_report(now, ntp) {
                    // Only the first sender report carries the reception blocks
                    if let Some(blocks) = pending_blocks.take() {
                        report.report_blocks = blocks;
                    }
                    packets.push(RtcpPacket::SenderReport(report));
                }
            }
            if let Some(blocks) = pending_blocks {
                let mut report = RtcpReceiverReport::new(state.rtcp_ssrc);
                report.report_blocks = blocks;
                packets.push(RtcpPacket::ReceiverReport(report));
            }

            let rtcp_ssrc = state.rtcp_ssrc;
            let remote_ssrcs: Vec<RtpSsrc> = state.streams.iter().filter_map(MediaStream::remote_ssrc).collect();
            if let Some(estimate) = state.incoming.estimate(now, worst_loss) {
                if !remote_ssrcs.is_empty() {
                    packets.push(RtcpPacket::Remb(RtcpRemb::new(rtcp_ssrc, estimate, remote_ssrcs)));
                }
            }

            state.rtcp_reports_sent += 1;
            (RtcpPacket::serialize_compound(&packets)?, state.stats())
        };

        let datagram = self.srtp.lock().protect_rtcp(&compound)?;
        self.transport
            .send(&datagram)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        self.emit(MediaEvent::StatsUpdated(stats));
        Ok(())
    }

    /// Drive the pipeline: process inbound datagrams and send reports every
    /// `report_interval` until cancelled or the inbound queue closes
    pub async fn run(&self, mut inbound: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        let mut reports = tokio::time::interval(self.config.report_interval());
        reports.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        reports.tick().await;

        info!(streams = self.state.lock().streams.len(), "Media pipeline started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = inbound.recv() => {
                    let Some(datagram) = datagram else { break };
                    if let Err(e) = self.handle_datagram(&datagram) {
                        if e.is_packet_rejection() {
                            debug!("Dropped media datagram: {}", e);
                        } else {
                            warn!("Failed to process media datagram: {}", e);
                        }
                    }
                }
                _ = reports.tick() => {
                    if let Err(e) = self.send_reports().await {
                        warn!("Failed to send RTCP reports: {}", e);
                    }
                }
            }
        }
        self.stopped.store(true, Ordering::Release);
        info!("Media pipeline stopped");
    }

    fn emit(&self, event: MediaEvent) {
        // The receiver goes away when the owning session closes
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
