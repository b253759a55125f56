//! Per-connection RTMP driver
//!
//! State machine: `Handshaking → Connected → Ready → Publishing → Closed`.
//! Media is accepted only while `Publishing`. Protocol errors are fatal to
//! the connection, never the server; per-frame codec errors drop the frame
//! and keep the session alive.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};

use crate::auth::TokenStore;
use crate::config::Config;
use crate::error::{AuthError, Error, MediaError, ProtocolError, Result};
use crate::hls::Segmenter;
use crate::media::flv::AvcPacketType;
use crate::media::{
    annex_b_with_parameter_sets, avcc_to_annex_b, AacConfig, AudioTag, AvcConfig, VideoTag,
};
use crate::protocol::constants::{
    DEFAULT_PEER_BANDWIDTH, DEFAULT_WINDOW_ACK_SIZE, PUBLISH_STREAM_ID,
};
use crate::protocol::message::{
    self, ConnectParams, OutboundMessage, PublishParams, RtmpMessage,
};
use crate::protocol::{server_handshake, ChunkReader, ChunkWriter};
use crate::registry::{
    AudioCodecInfo, MediaFrame, RegistryError, StreamKey, StreamRegistry, VideoCodecInfo,
};
use crate::amf::AmfValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Ready,
    Publishing,
}

enum Flow {
    Continue,
    Closed,
}

/// One accepted RTMP connection
pub struct Connection {
    session_id: u64,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    tokens: Arc<TokenStore>,
    segmenter: Arc<Segmenter>,

    phase: Phase,
    stream_key: Option<StreamKey>,
    avc_config: Option<AvcConfig>,
    pending_dimensions: Option<(u32, u32, Option<f64>)>,
    window_ack_size: u32,
    last_ack: u64,
    injection_warned: bool,
    bad_frames: u64,
}

impl Connection {
    pub fn new(
        session_id: u64,
        peer_addr: SocketAddr,
        config: Arc<Config>,
        registry: Arc<StreamRegistry>,
        tokens: Arc<TokenStore>,
        segmenter: Arc<Segmenter>,
    ) -> Self {
        Self {
            session_id,
            peer_addr,
            config,
            registry,
            tokens,
            segmenter,
            phase: Phase::Connected,
            stream_key: None,
            avc_config: None,
            pending_dimensions: None,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            last_ack: 0,
            injection_warned: false,
            bad_frames: 0,
        }
    }

    /// Drive the connection to completion, then tear down its stream
    /// exactly once.
    pub async fn run<S>(mut self, mut socket: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = async {
            server_handshake(&mut socket).await?;
            tracing::debug!(session_id = self.session_id, "handshake complete");

            let (read_half, write_half) = tokio::io::split(socket);
            let mut reader = ChunkReader::new(BufReader::new(read_half));
            let mut writer = ChunkWriter::new(BufWriter::new(write_half));

            self.message_loop(&mut reader, &mut writer).await
        }
        .await;

        // Exactly-once teardown for every exit path
        if let Some(key) = self.stream_key.take() {
            self.segmenter.stop(&key).await;
            self.registry.set_stopped(&key);
            tracing::info!(
                session_id = self.session_id,
                stream = %key,
                dropped_bad_frames = self.bad_frames,
                "publisher disconnected"
            );
        }

        result
    }

    async fn message_loop<R, W>(
        &mut self,
        reader: &mut ChunkReader<R>,
        writer: &mut ChunkWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let raw = match reader.read_message().await {
                Ok(raw) => raw,
                // Peer hangup between messages is a normal end of session
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            self.maybe_acknowledge(reader.bytes_read(), writer).await?;

            let message = RtmpMessage::decode(raw)?;
            if let RtmpMessage::SetChunkSize(size) = message {
                reader.set_chunk_size(size)?;
                tracing::debug!(session_id = self.session_id, size, "peer chunk size");
                continue;
            }

            match self.handle_message(message, writer).await? {
                Flow::Continue => {}
                Flow::Closed => return Ok(()),
            }
        }
    }

    async fn handle_message<W>(
        &mut self,
        message: RtmpMessage,
        writer: &mut ChunkWriter<W>,
    ) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        match message {
            RtmpMessage::Command {
                name,
                transaction_id,
                object,
                args,
            } => self.handle_command(&name, transaction_id, object, args, writer).await,
            RtmpMessage::Data(values) => {
                self.handle_metadata(&values);
                Ok(Flow::Continue)
            }
            RtmpMessage::Video { timestamp, payload } => {
                self.handle_video(timestamp, payload).await
            }
            RtmpMessage::Audio { timestamp, payload } => {
                self.handle_audio(timestamp, payload)
            }
            RtmpMessage::WindowAckSize(size) => {
                self.window_ack_size = size;
                Ok(Flow::Continue)
            }
            // Chunk size updates are applied in message_loop, where the
            // reader is reachable
            RtmpMessage::SetChunkSize(_) => Ok(Flow::Continue),
            RtmpMessage::Ack(_)
            | RtmpMessage::Abort(_)
            | RtmpMessage::UserControl(_)
            | RtmpMessage::SetPeerBandwidth { .. }
            | RtmpMessage::Unknown { .. } => Ok(Flow::Continue),
        }
    }

    async fn handle_command<W>(
        &mut self,
        name: &str,
        transaction_id: f64,
        object: AmfValue,
        args: Vec<AmfValue>,
        writer: &mut ChunkWriter<W>,
    ) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        match name {
            "connect" => {
                if self.phase != Phase::Connected {
                    return Err(ProtocolError::UnexpectedCommand("connect".into()).into());
                }
                let params = ConnectParams::from_object(&object);
                tracing::info!(
                    session_id = self.session_id,
                    app = %params.app,
                    tc_url = ?params.tc_url,
                    "connect"
                );

                if params.app != self.config.rtmp_app {
                    self.send(writer, message::connect_error(transaction_id, "unknown application"))
                        .await?;
                    return Err(ProtocolError::PublishRejected(format!(
                        "unknown app {:?}",
                        params.app
                    ))
                    .into());
                }

                self.send(writer, message::window_ack_size(DEFAULT_WINDOW_ACK_SIZE)).await?;
                self.send(writer, message::set_peer_bandwidth(DEFAULT_PEER_BANDWIDTH)).await?;
                self.send(writer, message::set_chunk_size(self.config.chunk_size)).await?;
                writer.set_chunk_size(self.config.chunk_size);
                self.send(writer, message::connect_result(transaction_id)).await?;

                self.phase = Phase::Ready;
                Ok(Flow::Continue)
            }
            "releaseStream" | "FCPublish" => {
                self.send(writer, message::simple_result(transaction_id)).await?;
                Ok(Flow::Continue)
            }
            "createStream" => {
                self.send(writer, message::create_stream_result(transaction_id)).await?;
                Ok(Flow::Continue)
            }
            "publish" => {
                if self.phase != Phase::Ready {
                    return Err(ProtocolError::UnexpectedCommand("publish".into()).into());
                }
                let publishing_name = args
                    .first()
                    .and_then(AmfValue::as_str)
                    .ok_or_else(|| ProtocolError::UnexpectedCommand("publish without name".into()))?;
                let publish_type = args
                    .get(1)
                    .and_then(AmfValue::as_str)
                    .unwrap_or("live");
                let params = PublishParams::parse(publishing_name, publish_type);
                self.handle_publish(params, writer).await
            }
            "FCUnpublish" | "deleteStream" | "closeStream" => {
                tracing::debug!(session_id = self.session_id, command = name, "publisher closing");
                Ok(Flow::Closed)
            }
            other => {
                tracing::debug!(session_id = self.session_id, command = other, "ignored command");
                Ok(Flow::Continue)
            }
        }
    }

    /// Admission: token check, registry claim, segmentation start.
    async fn handle_publish<W>(
        &mut self,
        params: PublishParams,
        writer: &mut ChunkWriter<W>,
    ) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        if params.publish_type != "live" {
            self.send(writer, message::publish_bad_name("only live publishing is supported"))
                .await?;
            return Err(ProtocolError::PublishRejected(params.publish_type).into());
        }

        let key = match StreamKey::parse(&params.stream_key) {
            Ok(key) => key,
            Err(e) => {
                self.send(writer, message::publish_bad_name("invalid stream key")).await?;
                return Err(e.into());
            }
        };

        match (&params.token, self.config.require_publish_token) {
            (Some(token), _) => {
                if let Err(e) =
                    self.tokens
                        .validate_and_consume(token, &key, Some(self.peer_addr.ip()))
                {
                    tracing::warn!(
                        session_id = self.session_id,
                        stream = %key,
                        error = %e,
                        "publish token rejected"
                    );
                    self.send(writer, message::publish_bad_name("authentication failed")).await?;
                    return Err(e.into());
                }
            }
            (None, true) => {
                tracing::warn!(session_id = self.session_id, stream = %key, "publish without token");
                self.send(writer, message::publish_bad_name("publish token required")).await?;
                return Err(AuthError::TokenRequired.into());
            }
            (None, false) => {
                tracing::warn!(
                    session_id = self.session_id,
                    stream = %key,
                    "tokenless publish admitted by configuration"
                );
            }
        }

        if let Err(e) = self.registry.create(&key, self.peer_addr) {
            tracing::warn!(session_id = self.session_id, stream = %key, error = %e, "publish rejected");
            self.send(writer, message::publish_bad_name("stream key already in use")).await?;
            return Err(e.into());
        }

        if let Err(e) = self.registry.set_live(&key).and_then(|()| self.segmenter.start(&key)) {
            self.registry.set_stopped(&key);
            self.send(writer, message::publish_bad_name("failed to start stream")).await?;
            return Err(e.into());
        }

        self.send(writer, message::stream_begin(PUBLISH_STREAM_ID)).await?;
        self.send(writer, message::publish_start(key.as_str())).await?;

        tracing::info!(
            session_id = self.session_id,
            stream = %key,
            peer = %self.peer_addr,
            "publishing"
        );
        self.stream_key = Some(key);
        self.phase = Phase::Publishing;
        Ok(Flow::Continue)
    }

    async fn handle_video(&mut self, timestamp: u32, payload: bytes::Bytes) -> Result<Flow> {
        if self.phase != Phase::Publishing {
            return Ok(Flow::Continue);
        }
        let Some(key) = self.stream_key.clone() else {
            return Ok(Flow::Continue);
        };

        let tag = match VideoTag::parse(payload) {
            Ok(tag) => tag,
            Err(e @ MediaError::UnsupportedCodec(_)) => {
                tracing::warn!(session_id = self.session_id, error = %e, "unsupported codec, closing");
                return Err(e.into());
            }
            Err(e) => {
                self.bad_frames += 1;
                tracing::debug!(session_id = self.session_id, error = %e, "video frame dropped");
                return Ok(Flow::Continue);
            }
        };

        match tag.packet_type {
            AvcPacketType::SequenceHeader => {
                let config = AvcConfig::parse(tag.data).map_err(|e| {
                    tracing::warn!(session_id = self.session_id, error = %e, "bad sequence header");
                    Error::from(e)
                })?;

                self.registry.set_video_codec(
                    &key,
                    VideoCodecInfo {
                        avc: config.clone(),
                        width: None,
                        height: None,
                        frame_rate: None,
                    },
                )?;
                if let Some((w, h, fps)) = self.pending_dimensions {
                    self.registry.set_video_dimensions(&key, w, h, fps);
                }
                self.avc_config = Some(config);
                Ok(Flow::Continue)
            }
            AvcPacketType::EndOfSequence => Ok(Flow::Continue),
            AvcPacketType::Nalu => {
                let nal_length_size = self
                    .avc_config
                    .as_ref()
                    .map(|c| c.nal_length_size)
                    .unwrap_or(4);

                let annex_b = match avcc_to_annex_b(&tag.data, nal_length_size) {
                    Ok(data) => data,
                    Err(e) => {
                        self.bad_frames += 1;
                        tracing::debug!(session_id = self.session_id, error = %e, "frame dropped");
                        return Ok(Flow::Continue);
                    }
                };

                let frame_payload = if tag.is_keyframe() {
                    match &self.avc_config {
                        Some(config) => annex_b_with_parameter_sets(config, &annex_b),
                        None => {
                            if !self.injection_warned {
                                tracing::warn!(
                                    session_id = self.session_id,
                                    stream = %key,
                                    "keyframe before sequence header, forwarding without SPS/PPS"
                                );
                                self.injection_warned = true;
                            }
                            annex_b
                        }
                    }
                } else {
                    annex_b
                };

                let pts = timestamp.wrapping_add(tag.composition_time as u32);
                let frame = MediaFrame::video(key, pts, frame_payload, tag.is_keyframe());
                self.publish(frame)
            }
        }
    }

    fn handle_audio(&mut self, timestamp: u32, payload: bytes::Bytes) -> Result<Flow> {
        if self.phase != Phase::Publishing {
            return Ok(Flow::Continue);
        }
        let Some(key) = self.stream_key.clone() else {
            return Ok(Flow::Continue);
        };

        let tag = match AudioTag::parse(payload) {
            Ok(tag) => tag,
            Err(e) => {
                self.bad_frames += 1;
                tracing::debug!(session_id = self.session_id, error = %e, "audio frame dropped");
                return Ok(Flow::Continue);
            }
        };

        if tag.is_sequence_header {
            match AacConfig::parse(tag.data) {
                Ok(aac) => {
                    tracing::info!(
                        session_id = self.session_id,
                        stream = %key,
                        profile = aac.profile_name(),
                        sample_rate = aac.sample_rate,
                        channels = aac.channels,
                        "audio codec configured"
                    );
                    self.registry.set_audio_codec(&key, AudioCodecInfo { aac })?;
                }
                Err(e) => {
                    tracing::debug!(session_id = self.session_id, error = %e, "bad audio config");
                }
            }
            return Ok(Flow::Continue);
        }

        self.publish(MediaFrame::audio(key, timestamp, tag.data))
    }

    fn publish(&mut self, frame: MediaFrame) -> Result<Flow> {
        match self.registry.publish_frame(frame) {
            Ok(()) => Ok(Flow::Continue),
            // The stream was stopped out from under us (API stop, sustained
            // mux failure); end the connection cleanly.
            Err(RegistryError::NotLive(_)) | Err(RegistryError::UnknownStream(_)) => {
                tracing::info!(session_id = self.session_id, "stream stopped externally");
                Ok(Flow::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pick display dimensions and frame rate out of onMetaData.
    fn handle_metadata(&mut self, values: &[AmfValue]) {
        let is_metadata = values
            .iter()
            .any(|v| matches!(v.as_str(), Some("onMetaData" | "@setDataFrame")));
        if !is_metadata {
            return;
        }

        let Some(object) = values.iter().find(|v| v.as_object().is_some()) else {
            return;
        };

        let width = object.get_number("width").map(|v| v as u32);
        let height = object.get_number("height").map(|v| v as u32);
        let frame_rate = object.get_number("framerate").filter(|&f| f > 0.0);

        if let (Some(w), Some(h)) = (width, height) {
            self.pending_dimensions = Some((w, h, frame_rate));
            if let Some(key) = &self.stream_key {
                self.registry.set_video_dimensions(key, w, h, frame_rate);
            }
            tracing::info!(
                session_id = self.session_id,
                width = w,
                height = h,
                frame_rate = ?frame_rate,
                "stream metadata"
            );
        }
    }

    async fn maybe_acknowledge<W>(
        &mut self,
        bytes_read: u64,
        writer: &mut ChunkWriter<W>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.window_ack_size == 0 {
            return Ok(());
        }
        if bytes_read - self.last_ack >= self.window_ack_size as u64 {
            self.send(writer, message::acknowledgement(bytes_read as u32)).await?;
            self.last_ack = bytes_read;
        }
        Ok(())
    }

    async fn send<W>(&self, writer: &mut ChunkWriter<W>, out: OutboundMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_message(out.csid, 0, out.type_id, out.message_stream_id, &out.payload)
            .await
    }
}
