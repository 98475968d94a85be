//! Basic usage example for the courier wire protocol.

use bytes::BytesMut;
use courier_wire::{Array, Frame, FrameDecoder, Message, DEFAULT_MAX_FRAME_SIZE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Courier Wire Protocol Example ===\n");

    // 1. Build a message with a destination and a few typed fields
    println!("1. Building a message...");
    let message = Message::new()
        .with_destination("sample")
        .with("type", "example")
        .with("long", 101i64)
        .with("time", chrono::Utc::now())
        .with("tags", Array::String(vec!["a".into(), "b".into()]));
    println!("   {}", message);

    // 2. Encode it as a publish frame
    println!("\n2. Encoding a PUBLISH frame...");
    let frame_bytes = Frame::Publish {
        req_id: 1,
        message,
    }
    .encode(DEFAULT_MAX_FRAME_SIZE)?;
    println!("   Encoded frame size: {} bytes", frame_bytes.len());

    // 3. Decode it from a stream buffer
    println!("\n3. Decoding the frame...");
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::from(frame_bytes.as_ref());

    if let Some(raw) = decoder.decode(&mut buf)? {
        println!("   Frame type: {:?}", raw.header.typ);
        println!("   Request ID: {}", raw.header.req_id);
        if let Frame::Publish { message, .. } = Frame::decode(raw)? {
            println!("   Destination: {:?}", message.destination());
            println!("   Fields: {}", message.len());
        }
    }

    // 4. Publishing without a destination is rejected
    println!("\n4. Encoding a message without destination...");
    let result = Frame::Publish {
        req_id: 2,
        message: Message::new().with("type", "example"),
    }
    .encode(DEFAULT_MAX_FRAME_SIZE);
    println!("   Result: {:?}", result.err());

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
