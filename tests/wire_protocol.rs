//! Wire-level behaviour of `FrameTransport` against a raw peer

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use remote_desk_stream::protocol::{
    Envelope, KeyFrameRequestDto, MessageHeader, Payload, PayloadKind, ScreenRegionDto,
    HEADER_SIZE,
};
use remote_desk_stream::transport::{
    Ed25519Signer, Ed25519Verifier, FrameTransport, MessageHandlers, PayloadSigner,
    TransportOptions, TransportState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

fn frame(envelope: &Envelope) -> Vec<u8> {
    let body = envelope.encode().unwrap();
    let mut bytes = MessageHeader::new(envelope.is_signed(), body.len() as i32)
        .encode()
        .to_vec();
    bytes.extend_from_slice(&body);
    bytes
}

async fn read_envelope(raw: &mut DuplexStream) -> Envelope {
    let mut header = [0u8; HEADER_SIZE];
    raw.read_exact(&mut header).await.unwrap();
    let header = MessageHeader::decode(&header).unwrap();
    let mut body = vec![0u8; header.payload_len(usize::MAX).unwrap()];
    raw.read_exact(&mut body).await.unwrap();
    Envelope::decode(header.is_signed, &body).unwrap()
}

fn key_frame_options() -> (TransportOptions, mpsc::UnboundedReceiver<KeyFrameRequestDto>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = Arc::new(MessageHandlers::new());
    handlers.register_typed::<KeyFrameRequestDto, _>(move |request| {
        let _ = tx.send(request);
    });
    (TransportOptions::default().with_handlers(handlers), rx)
}

async fn closed_within_timeout(transport: &FrameTransport) {
    tokio::time::timeout(Duration::from_secs(5), transport.wait_for_close())
        .await
        .expect("transport did not close");
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_huge_size_claim_closes_without_reading_body() {
    let (mut raw, stream) = tokio::io::duplex(1024);
    let transport = FrameTransport::from_stream(stream, "raw", TransportOptions::default());

    raw.write_all(&MessageHeader::new(false, 500_000_000).encode())
        .await
        .unwrap();

    closed_within_timeout(&transport).await;
    let stats = transport.stats();
    assert_eq!(stats.protocol_violations, 1);
    assert_eq!(stats.messages_in, 0);
}

#[tokio::test]
async fn test_negative_size_closes_connection() {
    let (mut raw, stream) = tokio::io::duplex(1024);
    let transport = FrameTransport::from_stream(stream, "raw", TransportOptions::default());

    raw.write_all(&MessageHeader::new(false, -1).encode())
        .await
        .unwrap();

    closed_within_timeout(&transport).await;
    assert_eq!(transport.stats().protocol_violations, 1);
}

#[tokio::test]
async fn test_bad_delimiter_after_valid_message_closes_connection() {
    let (options, mut rx) = key_frame_options();
    let (mut raw, stream) = tokio::io::duplex(4096);
    let transport = FrameTransport::from_stream(stream, "raw", options);

    let valid = Envelope::Unsigned(
        KeyFrameRequestDto { session_id: Uuid::nil() }
            .to_unsigned()
            .unwrap(),
    );
    let mut corrupt = frame(&valid);
    corrupt[15] = 0;

    // The trailing valid frame is never dispatched
    let mut bytes = frame(&valid);
    bytes.extend_from_slice(&corrupt);
    bytes.extend_from_slice(&frame(&valid));
    raw.write_all(&bytes).await.unwrap();

    closed_within_timeout(&transport).await;
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.stats().protocol_violations, 1);
}

#[tokio::test]
async fn test_garbage_envelope_closes_connection() {
    let (mut raw, stream) = tokio::io::duplex(1024);
    let transport = FrameTransport::from_stream(stream, "raw", TransportOptions::default());

    raw.write_all(&MessageHeader::new(false, 3).encode())
        .await
        .unwrap();
    raw.write_all(&[0xFF, 0xFF, 0xFF]).await.unwrap();

    closed_within_timeout(&transport).await;
    assert_eq!(transport.stats().protocol_violations, 1);
}

#[tokio::test]
async fn test_tampered_signed_payload_is_dropped() {
    let (signer, _) = Ed25519Signer::generate().unwrap();
    let (options, mut rx) = key_frame_options();
    let options = options.with_verifier(Arc::new(Ed25519Verifier::trusting([
        signer.public_key()
    ])));
    let (mut raw, stream) = tokio::io::duplex(4096);
    let transport = FrameTransport::from_stream(stream, "raw", options);

    let request = KeyFrameRequestDto {
        session_id: Uuid::new_v4(),
    };
    let body = request.to_unsigned().unwrap().payload;

    let mut tampered = signer.sign(PayloadKind::KeyFrameRequest, body.clone()).unwrap();
    *tampered.payload.last_mut().unwrap() ^= 0x01;
    raw.write_all(&frame(&Envelope::Signed(tampered))).await.unwrap();

    let genuine = signer.sign(PayloadKind::KeyFrameRequest, body).unwrap();
    raw.write_all(&frame(&Envelope::Signed(genuine))).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, request);
    assert!(rx.try_recv().is_err());

    let stats = transport.stats();
    assert_eq!(stats.dropped_signed, 1);
    assert_eq!(stats.messages_in, 2);
    assert_eq!(transport.state(), TransportState::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_are_not_interleaved() {
    const SENDERS: usize = 16;
    const IMAGE_LEN: usize = 20_000;

    // A small pipe forces every frame through many partial writes
    let (mut raw, stream) = tokio::io::duplex(512);
    let transport = FrameTransport::from_stream(stream, "raw", TransportOptions::default());

    let mut senders = Vec::new();
    for i in 0..SENDERS {
        let transport = transport.clone();
        senders.push(tokio::spawn(async move {
            let region = ScreenRegionDto {
                session_id: Uuid::nil(),
                x: i as i32,
                y: 0,
                width: 1,
                height: 1,
                encoded_image: vec![i as u8; IMAGE_LEN],
            };
            transport.send(&region, false).await
        }));
    }

    let mut seen = HashSet::new();
    for _ in 0..SENDERS {
        let envelope = read_envelope(&mut raw).await;
        let region = envelope.decode_body::<ScreenRegionDto>().unwrap();
        assert_eq!(region.encoded_image.len(), IMAGE_LEN);
        assert!(region.encoded_image.iter().all(|&b| b == region.x as u8));
        assert!(seen.insert(region.x));
    }

    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    assert_eq!(seen.len(), SENDERS);
    assert_eq!(transport.stats().messages_out, SENDERS as u64);
}

#[tokio::test]
async fn test_close_sends_close_payload() {
    let (mut raw, stream) = tokio::io::duplex(1024);
    let transport = FrameTransport::from_stream(stream, "raw", TransportOptions::default());

    let closing = transport.clone();
    let close = tokio::spawn(async move { closing.close("shutting down").await });

    let envelope = read_envelope(&mut raw).await;
    assert_eq!(envelope.kind(), PayloadKind::Close);

    // Writer was shut down after the close payload
    let mut rest = Vec::new();
    raw.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    close.await.unwrap();
    assert_eq!(transport.state(), TransportState::Closed);
}
