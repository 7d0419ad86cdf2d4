use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::error::SfuError;
use crate::peer_session::PeerSession;
use crate::types::TrackMap;

/// ICE connectivity timeouts from the data-model contract: a link that goes
/// quiet for 2s triggers a keepalive, one that stays quiet for 7s is
/// reported `disconnected`, and one unreachable for 25s is reported
/// `failed` and torn down.
const ICE_DISCONNECTED_TIMEOUT_SECS: u64 = 7;
const ICE_FAILED_TIMEOUT_SECS: u64 = 25;
const ICE_KEEPALIVE_INTERVAL_SECS: u64 = 2;

pub struct MediaSetup;

impl MediaSetup {
    pub fn create_webrtc_api() -> webrtc::api::API {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "audio/opus".to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        ..Default::default()
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .unwrap_or_else(|e| panic!("Failed to register Opus codec: {}", e));

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/VP8".to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_owned(),
                        ..Default::default()
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .unwrap_or_else(|e| panic!("Failed to register VP8 codec: {}", e));

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/H264".to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_owned(),
                        ..Default::default()
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .unwrap_or_else(|e| error!("Failed to register H264 codec: {}", e));

        let extensions = vec![
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            "urn:ietf:params:rtp-hdrext:toffset",
            "urn:3gpp:video-orientation",
            "http://www.webrtc.org/experiments/rtp-hdrext/video-content-type",
        ];

        for extension in extensions {
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Video,
                None,
            );
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Audio,
                None,
            );
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(Duration::from_secs(ICE_DISCONNECTED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_FAILED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_KEEPALIVE_INTERVAL_SECS)),
        );

        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build()
    }

    /// Builds the ICE configuration: at least two independent STUN relays
    /// (so a single provider outage doesn't strand a peer) and every ICE
    /// transport type, since the Non-goals only exclude a TURN relay
    /// deployment, not reachability via whatever the host network allows.
    pub fn get_rtc_config() -> RTCConfiguration {
        let stun_urls = env::var("SFU_STUN_URLS").unwrap_or_else(|_| {
            "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302".to_string()
        });
        let urls: Vec<String> = stun_urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ice_transport_policy: RTCIceTransportPolicy::All,
            ..Default::default()
        }
    }

    /// Installs every track currently published in `room_id` onto `session`
    /// before that session's initial offer is created, so a joining peer
    /// only needs a single negotiation round-trip to see the whole room.
    pub async fn subscribe_to_existing_tracks(session: &PeerSession, tracks: &TrackMap) {
        for entry in tracks.iter() {
            let (t_room, t_stream) = entry.key();
            if *t_room != session.room_id {
                continue;
            }

            let broadcaster = entry.value();

            let local_track = Arc::new(TrackLocalStaticRTP::new(
                broadcaster.capability.clone(),
                t_stream.as_ref().to_string(),
                t_stream.as_ref().to_string(),
            ));

            let Ok(rtp_sender) = session
                .pc
                .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            else {
                continue;
            };

            session.egress_senders.insert(t_stream.clone(), rtp_sender.clone());

            let sender_clone = rtp_sender.clone();
            let broadcaster_for_rtcp = broadcaster.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((packets, _)) = sender_clone.read(&mut rtcp_buf).await {
                    for packet in packets {
                        if packet.as_any().is::<PictureLossIndication>() {
                            broadcaster_for_rtcp.request_keyframe().await;
                        }
                    }
                }
            });

            let params = rtp_sender.get_parameters().await;
            let ssrc = params.encodings.first().map(|e| e.ssrc).unwrap_or(0);
            let pt = params
                .rtp_parameters
                .codecs
                .first()
                .map(|c| c.payload_type)
                .unwrap_or(0);

            info!(stream = %t_stream, ssrc, pt, "[SFU] subscribed existing track for new peer");
            broadcaster
                .add_writer(local_track, t_stream.as_ref().to_string(), ssrc, pt)
                .await;
            broadcaster.clone().schedule_pli_retry();
        }
    }

    pub async fn configure_media_engine(pc: &webrtc::peer_connection::RTCPeerConnection) -> Result<(), SfuError> {
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(SfuError::from)?;

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(SfuError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_rtc_config_has_multiple_stun_servers() {
        let config = MediaSetup::get_rtc_config();
        assert!(!config.ice_servers.is_empty());
        assert!(config.ice_servers[0].urls.len() >= 2);
    }

    #[tokio::test]
    async fn test_configure_media_engine_adds_transceivers() {
        let api = MediaSetup::create_webrtc_api();
        let pc = api
            .new_peer_connection(MediaSetup::get_rtc_config())
            .await
            .unwrap();
        MediaSetup::configure_media_engine(&pc).await.unwrap();
        let transceivers = pc.get_transceivers().await;
        assert_eq!(transceivers.len(), 2);
    }
}
