use std::fmt::Write as _;
use std::io::Cursor;
use std::sync::Arc;

use aces_ingest_core::{normalize_app, AcesReader, NormalizeOptions};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn mk_document(apps: usize) -> Vec<u8> {
    let mut xml = String::from(r#"<?xml version="1.0"?><ACES version="4.2"><Header><Company>Bench</Company></Header>"#);
    for id in 0..apps {
        let _ = write!(
            xml,
            r#"<App action="A" id="{id}"><BaseVehicle id="{vehicle}"/><EngineBase id="12"/><Qty>1</Qty><PartType id="1684"/><Position id="22"/><Part BrandAAIAID="BBVL">P-{id}</Part><Qualifier id="2440"><param value="4"/><text>With <p1/> doors</text></Qualifier><VehicleType id="5"/><Note>install kit sold separately</Note><VendorNote id="7">bench</VendorNote></App>"#,
            vehicle = 5000 + id % 300,
        );
    }
    xml.push_str("</ACES>");
    xml.into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let document = mk_document(1_000);
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(u64::try_from(document.len()).unwrap_or(u64::MAX)));
    group.bench_function("parse_1000_apps", |b| {
        b.iter(|| {
            let reader = match AcesReader::new(Cursor::new(document.as_slice())) {
                Ok(reader) => reader,
                Err(err) => panic!("parse benchmark open failed: {err}"),
            };
            for record in reader {
                if let Err(err) = record {
                    panic!("parse benchmark record failed: {err}");
                }
            }
        });
    });
    group.finish();
}

fn bench_parse_and_normalize(c: &mut Criterion) {
    let document = mk_document(1_000);
    let source: Arc<str> = Arc::from("bench.xml");
    let options = NormalizeOptions::default();

    c.bench_function("parse_and_normalize_1000_apps", |b| {
        b.iter(|| {
            let reader = match AcesReader::new(Cursor::new(document.as_slice())) {
                Ok(reader) => reader,
                Err(err) => panic!("normalize benchmark open failed: {err}"),
            };
            for record in reader {
                let record = record.unwrap_or_else(|err| panic!("normalize benchmark record failed: {err}"));
                if let Err(err) = normalize_app(&record, &source, &options) {
                    panic!("normalize benchmark failed: {err}");
                }
            }
        });
    });
}

criterion_group!(normalize_benches, bench_parse, bench_parse_and_normalize);
criterion_main!(normalize_benches);
