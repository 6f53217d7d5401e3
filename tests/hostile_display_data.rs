//! A viewer fed malformed geometry by its host
//!
//! The host side is a bare `FrameTransport`, so every payload is exactly
//! what the test sends. Bad display sets and regions must be dropped
//! without closing the connection or touching the current surface.

use std::sync::Arc;
use std::time::Duration;

use remote_desk_stream::capture::{Bitmap, Rect, Rotation};
use remote_desk_stream::codec::RegionEncoder;
use remote_desk_stream::protocol::{DisplayDataDto, DisplayDto, ScreenRegionDto};
use remote_desk_stream::transport::{FrameTransport, TransportOptions, TransportState};
use remote_desk_stream::viewer::{SharedRenderer, ViewerSession};
use uuid::Uuid;

fn display(name: &str, bounds: Rect, is_primary: bool) -> DisplayDto {
    DisplayDto {
        device_name: name.to_string(),
        display_name: name.to_string(),
        bounds,
        is_primary,
        rotation: Rotation::Identity,
        scale_factor: 1.0,
    }
}

fn display_set(session_id: Uuid, displays: Vec<DisplayDto>) -> DisplayDataDto {
    DisplayDataDto { session_id, displays }
}

fn region(session_id: Uuid, x: i32, y: i32, bitmap: &Bitmap) -> ScreenRegionDto {
    ScreenRegionDto {
        session_id,
        x,
        y,
        width: bitmap.width() as i32,
        height: bitmap.height() as i32,
        encoded_image: RegionEncoder::png().encode(bitmap).unwrap(),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn connected() -> (FrameTransport, ViewerSession, SharedRenderer) {
    let (host_io, viewer_io) = tokio::io::duplex(256 * 1024);
    let host = FrameTransport::from_stream(host_io, "viewer", TransportOptions::default());
    let viewer = ViewerSession::from_stream(viewer_io, "host", TransportOptions::default())
        .await
        .unwrap();
    let renderer = Arc::clone(viewer.renderer());
    (host, viewer, renderer)
}

#[tokio::test]
async fn test_overflowing_display_set_leaves_viewer_without_surface() {
    let (host, viewer, renderer) = connected().await;
    let session_id = Uuid::new_v4();

    host.send(
        &display_set(
            session_id,
            vec![
                display("main", Rect::new(0, 0, 64, 48), true),
                display("edge", Rect::new(i32::MAX - 10, 0, 64, 48), false),
            ],
        ),
        false,
    )
    .await
    .unwrap();
    // Without an accepted display set there is no surface to paint on
    let pixels = Bitmap::filled(2, 2, [9, 9, 9, 255]);
    host.send(&region(session_id, 0, 0, &pixels), false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let renderer = renderer.lock().unwrap();
        assert!(renderer.snapshot().is_none());
        assert_eq!(renderer.session_id(), None);
        assert_eq!(renderer.regions_applied(), 0);
    }
    assert_eq!(viewer.transport().state(), TransportState::Open);
    assert_eq!(host.state(), TransportState::Open);
}

#[tokio::test]
async fn test_hostile_updates_keep_the_current_surface() {
    let (host, viewer, renderer) = connected().await;
    let session_id = Uuid::new_v4();
    let good = vec![
        display("left", Rect::new(-32, 0, 32, 32), false),
        display("main", Rect::new(0, 0, 64, 48), true),
    ];

    host.send(&display_set(session_id, good), false).await.unwrap();
    eventually(|| renderer.lock().unwrap().snapshot().is_some()).await;

    // Representable but far above any real desktop
    host.send(
        &display_set(
            Uuid::new_v4(),
            vec![display("huge", Rect::new(0, 0, 1_000_000, 1_000_000), true)],
        ),
        false,
    )
    .await
    .unwrap();
    // Spread wider than i32 can measure
    host.send(
        &display_set(
            Uuid::new_v4(),
            vec![
                display("far-left", Rect::new(i32::MIN, 0, 10, 10), true),
                display("far-right", Rect::new(i32::MAX - 10, 0, 10, 10), false),
            ],
        ),
        false,
    )
    .await
    .unwrap();

    let red = Bitmap::filled(2, 2, [0, 0, 255, 255]);
    // Offset from the surface origin overflows
    host.send(&region(session_id, i32::MAX - 1, 0, &red), false)
        .await
        .unwrap();
    host.send(&region(session_id, 4, 4, &red), false).await.unwrap();

    eventually(|| renderer.lock().unwrap().regions_applied() >= 1).await;
    {
        let renderer = renderer.lock().unwrap();
        assert_eq!(renderer.regions_applied(), 1);
        assert_eq!(renderer.session_id(), Some(session_id));
        assert_eq!(renderer.surface_bounds(), Rect::new(-32, 0, 96, 48));
        assert_eq!(renderer.displays().len(), 2);
        let surface = renderer.snapshot().unwrap();
        assert_eq!(surface.pixel(36, 4), Some([0, 0, 255, 255]));
    }
    assert_eq!(viewer.transport().state(), TransportState::Open);

    viewer.close("done").await;
    tokio::time::timeout(Duration::from_secs(10), host.wait_for_close())
        .await
        .unwrap();
}
