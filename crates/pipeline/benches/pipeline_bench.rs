use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};
use futures::executor::block_on;
use futures::future::poll_fn;
use http::{Request, Response, StatusCode};
use micro_pipeline::codec::{RequestDecoder, ResponseEncoder};
use micro_pipeline::connection::{HttpConnection, IoTransport, OutputWriter, WriterEvent};
use micro_pipeline::handler::make_handler;
use micro_pipeline::pipeline::ResponseCoordinator;
use micro_pipeline::protocol::{Buffer, ResponseBody, SharedBytes, WriteGroup};
use std::error::Error;
use std::hint::black_box;
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::codec::Decoder;

const PIPELINED: usize = 16;

async fn test_handler(_req: Request<Bytes>) -> Result<Response<String>, Box<dyn Error + Send + Sync>> {
    let response = Response::builder().status(StatusCode::OK).body("Hello World!".to_string()).unwrap();
    Ok(response)
}

fn pipelined_requests(n: usize) -> Vec<u8> {
    b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n".repeat(n)
}

fn bench_request_decoder(c: &mut Criterion) {
    let requests = pipelined_requests(PIPELINED);

    c.bench_function("decode_pipelined_requests", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::new();
            let mut bytes = BytesMut::from(&requests[..]);
            while let Some(request) = decoder.decode(&mut bytes).unwrap() {
                black_box(request);
            }
        });
    });
}

fn bench_response_encoder(c: &mut Criterion) {
    c.bench_function("encode_simple_response", |b| {
        b.iter(|| {
            let mut encoder = ResponseEncoder::new();
            let response = Response::builder().status(StatusCode::OK).body(ResponseBody::from("Hello World!")).unwrap();
            black_box(encoder.encode(response).unwrap());
        });
    });
}

fn bench_coordinator(c: &mut Criterion) {
    c.bench_function("release_reversed_responses", |b| {
        b.iter(|| {
            let mut coordinator = ResponseCoordinator::new(PIPELINED);
            let sequences: Vec<u64> = (0..PIPELINED).map(|_| coordinator.register_slot(None).unwrap()).collect();

            for &sequence in sequences.iter().rev() {
                coordinator.attach_response(sequence, WriteGroup::from_bytes(&b"HTTP/1.1 200 OK\r\n\r\n"[..])).unwrap();
            }
            while let Some(group) = coordinator.poll_releasable() {
                let sequence = group.sequence().unwrap();
                drop(black_box(group));
                coordinator.mark_done(sequence).unwrap();
            }
        });
    });
}

fn bench_output_writer(c: &mut Criterion) {
    let body = SharedBytes::from(vec![b'x'; 16 * 1024]);

    c.bench_function("drain_shared_bodies", |b| {
        b.iter(|| {
            let mut coordinator = ResponseCoordinator::new(PIPELINED);
            for _ in 0..PIPELINED {
                let sequence = coordinator.register_slot(None).unwrap();
                let group = WriteGroup::new([
                    Buffer::from_static(b"HTTP/1.1 200 OK\r\ncontent-length: 16384\r\n\r\n"),
                    Buffer::shared(&body, 0..body.len()).unwrap(),
                ])
                .unwrap();
                coordinator.attach_response(sequence, group).unwrap();
            }

            let mut writer = OutputWriter::new(PIPELINED);
            let mut transport = IoTransport::new(tokio::io::sink());
            let event = block_on(poll_fn(|cx| writer.poll_drive(cx, &mut transport, &mut coordinator))).unwrap();
            assert_eq!(event, WriterEvent::Idle);
            black_box(writer.bytes_written());
        });
    });
}

fn bench_http_connection(c: &mut Criterion) {
    let requests = pipelined_requests(PIPELINED);
    let handler = Arc::new(make_handler(test_handler));
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    c.bench_function("process_pipelined_requests", |b| {
        b.to_async(&runtime).iter(|| {
            let reader = Cursor::new(requests.clone());
            let connection = HttpConnection::new(reader, IoTransport::new(tokio::io::sink()));
            let handler = Arc::clone(&handler);
            async move { black_box(connection.process(handler).await.unwrap()) }
        });
    });
}

criterion_group!(benches, bench_request_decoder, bench_response_encoder, bench_coordinator, bench_output_writer, bench_http_connection);
criterion_main!(benches);
