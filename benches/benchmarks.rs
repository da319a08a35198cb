use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rtmp_sfu_gateway::modules::codec::{AudioSpecificConfig, AvcDecoderConfigurationRecord};
use rtmp_sfu_gateway::modules::rtmp::tags::NalUnits;
use rtmp_sfu_gateway::modules::rtp::{h264, MAX_PAYLOAD_LEN};

fn bench_h264_packetize(c: &mut Criterion) {
    // IDR slice large enough to need FU-A
    let mut nal = vec![0x65];
    nal.extend((0..40_000u32).map(|i| i as u8));

    let packets = h264::packetize(&nal, MAX_PAYLOAD_LEN, 3000);
    assert!(packets.len() > 1, "expected fragmentation");

    c.bench_function("h264_packetize_fu_a", |b| {
        b.iter(|| h264::packetize(black_box(&nal), MAX_PAYLOAD_LEN, 3000))
    });
}

fn bench_avc_record(c: &mut Criterion) {
    let record = hex::decode("0142c01effe1000a6742c01e95a0280f684001000468ce3c80").unwrap();

    // Attempt to parse the record once before benchmarking
    match AvcDecoderConfigurationRecord::parse(&record) {
        Ok(_) => {
            c.bench_function("avc_decoder_configuration_record", |b| {
                b.iter(|| AvcDecoderConfigurationRecord::parse(black_box(&record)).unwrap())
            });
        }
        Err(e) => {
            panic!("Failed to parse AVC record: {:?}", e);
        }
    }
}

fn bench_audio_specific_config(c: &mut Criterion) {
    // HE-AAC v2: SBR+PS over a 24 kHz core, 48 kHz output
    let config = [0xEB, 0x09, 0x88, 0x00];
    AudioSpecificConfig::parse(&config).unwrap();

    c.bench_function("audio_specific_config", |b| {
        b.iter(|| AudioSpecificConfig::parse(black_box(&config)).unwrap())
    });
}

fn bench_nal_split(c: &mut Criterion) {
    let mut tag = Vec::new();
    for size in [2usize, 30, 1500, 9000, 400] {
        tag.extend_from_slice(&(size as u32).to_be_bytes());
        tag.extend(std::iter::repeat(0x41).take(size));
    }

    c.bench_function("nal_split", |b| {
        b.iter(|| {
            NalUnits::new(black_box(&tag), 4)
                .unwrap()
                .filter_map(Result::ok)
                .count()
        })
    });
}

criterion_group!(
    benches,
    bench_h264_packetize,
    bench_avc_record,
    bench_audio_specific_config,
    bench_nal_split
);
criterion_main!(benches);
