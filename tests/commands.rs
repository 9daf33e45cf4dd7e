use std::time::Duration;

use color_eyre::Result;
use common::{test_config, MockDevice};
use jerome_gateway::{
    controller::{ControllerHandle, LineEvent},
    modes::LineMode,
    protocol::Reply,
};
use pretty_assertions::assert_eq;
use tokio::time::timeout;

mod common;

#[tokio::test]
async fn commands_are_sent_one_at_a_time_in_order() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,1,1");

        // Nothing else goes out until the device answers.
        connection.expect_silence().await;
        connection.reply_ok().await.unwrap();

        assert_eq!(connection.read_command().await.unwrap(), "WR,2,1");
        connection.reply_ok().await.unwrap();

        // Line 3 was low, so the toggle writes high.
        assert_eq!(connection.read_command().await.unwrap(), "WR,3,1");
        connection.reply_ok().await.unwrap();
    };

    // The three writes are issued at once; replies come back in
    // the same order.
    let (first, second, third, ()) = tokio::join!(
        controller.set_line_state(1, true),
        controller.set_line_state(2, true),
        controller.toggle_line(3),
        device_side,
    );

    assert_eq!(first?, Reply::Ok);
    assert_eq!(second?, Reply::Ok);
    assert_eq!(third?, Reply::Ok);

    Ok(())
}

#[tokio::test]
async fn events_are_not_mistaken_for_replies() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let mut lines = controller.subscribe_lines();

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,2,1");

        // An unrelated event sneaks in ahead of the reply.
        connection.send_line("#EVT,5,1").await.unwrap();
        connection.reply_ok().await.unwrap();
    };

    let (reply, ()) = tokio::join!(controller.set_line_state(2, true), device_side);
    assert_eq!(reply?, Reply::Ok);

    // The event updated line 5 without completing the command.
    let event = timeout(common::LONG, lines.recv()).await??;
    assert_eq!(
        event,
        LineEvent {
            line: 5,
            state: true
        }
    );

    // The acknowledged write then updated line 2.
    let event = timeout(common::LONG, lines.recv()).await??;
    assert_eq!(
        event,
        LineEvent {
            line: 2,
            state: true
        }
    );

    Ok(())
}

#[tokio::test]
async fn repeated_events_only_notify_on_change() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let mut lines = controller.subscribe_lines();

    connection.send_line("#EVT,4,1").await?;
    connection.send_line("#EVT,4,1").await?;
    connection.send_line("#EVT,4,0").await?;

    let event = timeout(common::LONG, lines.recv()).await??;
    assert_eq!(
        event,
        LineEvent {
            line: 4,
            state: true
        }
    );

    // The duplicate was swallowed; the next event is the change
    // back to low.
    let event = timeout(common::LONG, lines.recv()).await??;
    assert_eq!(
        event,
        LineEvent {
            line: 4,
            state: false
        }
    );

    Ok(())
}

#[tokio::test]
async fn err_reply_is_surfaced_and_queue_continues() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,1,1");
        connection.reply_err().await.unwrap();

        assert_eq!(connection.read_command().await.unwrap(), "WR,4,1");
        connection.reply_ok().await.unwrap();
    };

    let (first, second, ()) = tokio::join!(
        controller.set_line_state(1, true),
        controller.set_line_state(4, true),
        device_side,
    );

    // The rejection is delivered verbatim and is not fatal.
    assert_eq!(first?, Reply::Err);
    assert_eq!(second?, Reply::Ok);

    Ok(())
}

#[tokio::test]
async fn rejected_write_does_not_touch_the_cache() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,6,1");
        connection.reply_err().await.unwrap();
    };

    let (reply, ()) = tokio::join!(controller.set_line_state(6, true), device_side);
    assert_eq!(reply?, Reply::Err);

    assert_eq!(controller.line_state(6).await?, Some(false));

    Ok(())
}

#[tokio::test]
async fn pulse_flips_holds_and_restores() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,3,1");
        let flipped_at = tokio::time::Instant::now();
        connection.reply_ok().await.unwrap();

        assert_eq!(connection.read_command().await.unwrap(), "WR,3,0");
        assert!(flipped_at.elapsed() >= Duration::from_millis(250));
        connection.reply_ok().await.unwrap();
    };

    let (reply, ()) = tokio::join!(controller.pulse_line(3), device_side);
    assert_eq!(reply?, Reply::Ok);

    assert_eq!(controller.line_state(3).await?, Some(false));

    Ok(())
}

#[tokio::test]
async fn pulse_aborts_when_the_first_write_is_rejected() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    let device_side = async {
        assert_eq!(connection.read_command().await.unwrap(), "WR,3,1");
        connection.reply_err().await.unwrap();

        // No second half: wait out the hold period and then some.
        connection
            .expect_silence_for(Duration::from_millis(500))
            .await;
    };

    let (reply, ()) = tokio::join!(controller.pulse_line(3), device_side);
    assert_eq!(reply?, Reply::Err);

    Ok(())
}

#[tokio::test]
async fn out_mode_corrects_a_misdirected_line() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    // Registered before the device even connects.
    controller.set_line_mode(5, LineMode::Out)?;

    let mut connection = device.accept().await?;
    // All lines are inputs; line 5 must become an output.
    connection.handshake("11111111", "00000000").await?;

    assert_eq!(connection.read_command().await?, "IO,SET,5,0");
    connection.reply_ok().await?;

    // The acknowledged fix satisfies the mode; nothing follows.
    connection.expect_silence().await;

    Ok(())
}

#[tokio::test]
async fn pulse_mode_clears_a_line_resting_high() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    controller.set_line_mode(4, LineMode::Pulse)?;

    let mut connection = device.accept().await?;
    // Directions are fine, but line 4 sits high.
    connection.handshake("00000000", "00010000").await?;

    assert_eq!(connection.read_command().await?, "WR,4,0");
    connection.reply_ok().await?;

    connection.expect_silence().await;
    assert_eq!(controller.line_state(4).await?, Some(false));

    Ok(())
}

#[tokio::test]
async fn setting_a_mode_rechecks_immediately() -> Result<()> {
    let device = MockDevice::bind().await?;
    let controller = ControllerHandle::new(test_config(device.port()));

    let mut connection = device.accept().await?;
    connection.handshake("00000000", "00000000").await?;

    controller.set_line_mode(2, LineMode::In)?;

    assert_eq!(connection.read_command().await?, "IO,SET,2,1");
    connection.reply_ok().await?;
    connection.expect_silence().await;

    Ok(())
}
