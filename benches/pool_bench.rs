use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use easel::{Config, Node, NodeBuilder, ServiceName, ZeroCopySend};
use tempfile::TempDir;

#[repr(C)]
#[derive(Clone, Copy)]
struct Frame {
    data: [u8; 4096],
}

unsafe impl ZeroCopySend for Frame {}

fn bench_node(dir: &TempDir) -> Node {
    let config = Config::default().with_root_dir(dir.path());
    NodeBuilder::new()
        .config(&config)
        .signal_handling(false)
        .create()
        .unwrap()
}

fn benchmark_send_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("PubSub_RoundTrip");
    let dir = TempDir::new().unwrap();
    let node = bench_node(&dir);

    for subscribers in [1usize, 4, 8].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("u64", subscribers),
            subscribers,
            |b, &subscribers| {
                let service = node
                    .service_builder(&ServiceName::new(&format!("bench/u64/{}", subscribers)).unwrap())
                    .publish_subscribe::<u64>()
                    .max_subscribers(subscribers)
                    .open_or_create()
                    .unwrap();
                let publisher = service.publisher_builder().create().unwrap();
                let ports: Vec<_> = (0..subscribers)
                    .map(|_| service.subscriber_builder().create().unwrap())
                    .collect();

                let mut value = 0u64;
                b.iter(|| {
                    value += 1;
                    publisher.send_copy(value).unwrap();
                    for subscriber in &ports {
                        let sample = subscriber.receive().unwrap().unwrap();
                        black_box(*sample.payload());
                    }
                });
            },
        );
    }

    group.finish();
}

fn benchmark_payload_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("PubSub_Payloads");
    let dir = TempDir::new().unwrap();
    let node = bench_node(&dir);

    group.throughput(Throughput::Bytes(4096));
    group.bench_function("frame_4k_in_place", |b| {
        let service = node
            .service_builder(&ServiceName::new("bench/frame").unwrap())
            .publish_subscribe::<Frame>()
            .open_or_create()
            .unwrap();
        let publisher = service.publisher_builder().create().unwrap();
        let subscriber = service.subscriber_builder().create().unwrap();

        b.iter(|| {
            let mut sample = publisher.loan_uninit().unwrap();
            sample.payload_mut().write(Frame { data: [7; 4096] });
            // SAFETY: the payload was written above
            let frame = unsafe { sample.assume_init() };
            frame.send().unwrap();
            let received = subscriber.receive().unwrap().unwrap();
            black_box(received.payload().data[4095]);
        });
    });

    for len in [64usize, 1024, 16384].iter() {
        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::new("slice_copy", len), len, |b, &len| {
            let service = node
                .service_builder(&ServiceName::new(&format!("bench/slice/{}", len)).unwrap())
                .publish_subscribe_slice::<u8>()
                .max_slice_len(len)
                .open_or_create()
                .unwrap();
            let publisher = service.publisher_builder().create().unwrap();
            let subscriber = service.subscriber_builder().create().unwrap();
            let data = vec![0xAB; len];

            b.iter(|| {
                publisher.send_slice_copy(&data).unwrap();
                let received = subscriber.receive().unwrap().unwrap();
                black_box(received.payload_slice().len());
            });
        });
    }

    group.finish();
}

fn benchmark_loan_return(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let node = bench_node(&dir);
    let service = node
        .service_builder(&ServiceName::new("bench/loan").unwrap())
        .publish_subscribe::<u64>()
        .open_or_create()
        .unwrap();
    let publisher = service.publisher_builder().create().unwrap();

    c.bench_function("loan_and_drop", |b| {
        b.iter(|| {
            let sample = publisher.loan().unwrap();
            black_box(&sample);
        });
    });
}

criterion_group!(
    benches,
    benchmark_send_receive,
    benchmark_payload_sizes,
    benchmark_loan_return
);
criterion_main!(benches);
