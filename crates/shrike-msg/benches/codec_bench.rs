//! Codec benchmarks: encode/decode throughput for typical messages.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use shrike_msg::{Code, Message, MessageId, MessageType, OptionNumber, Token};

fn typical_request() -> Message {
    let mut msg = Message::new(MessageType::Con, Code::GET, MessageId(0x4711));
    msg.token = Token::new(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    msg.options.set_uri_path("/sensors/temperature/history");
    msg.options.set_uint(OptionNumber::ACCEPT, 50);
    msg
}

fn typical_response() -> Message {
    let mut msg = Message::new(MessageType::Ack, Code::CONTENT, MessageId(0x4711));
    msg.token = Token::new(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    msg.options.set_uint(OptionNumber::CONTENT_FORMAT, 50);
    msg.payload = vec![0x42; 512];
    msg
}

fn bench_encode(c: &mut Criterion) {
    let request = typical_request();
    let response = typical_response();

    c.bench_function("encode_request", |b| {
        b.iter(|| black_box(&request).encode());
    });
    c.bench_function("encode_response_512", |b| {
        b.iter(|| black_box(&response).encode());
    });
}

fn bench_decode(c: &mut Criterion) {
    let request = typical_request().encode();
    let response = typical_response().encode();

    c.bench_function("decode_request", |b| {
        b.iter(|| Message::decode(black_box(&request)).unwrap());
    });
    c.bench_function("decode_response_512", |b| {
        b.iter(|| Message::decode(black_box(&response)).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
