// test of the container format: round trips, preamble rejection, index invariants
use std::io::{Read,Seek,SeekFrom,Write};
use std::path::Path;
use skybin::codec::{ByteOrder,DataType,Value};
use skybin::schema::{FieldDescriptor,RecordPacker,Schema};
use skybin::container::{ContainerWriter,Reader,StarReader,TrixelDirReader,TrixelDescriptor};
use skybin::catalog::{StarLayout,StarWriter};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scenario_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("RA",DataType::Int32,4,1_000_000).unwrap(),
        FieldDescriptor::new("Dec",DataType::Int32,4,100_000).unwrap(),
        FieldDescriptor::new("B",DataType::Int16,2,1000).unwrap()
    ]
}

fn scenario_values() -> Vec<(&'static str,Value)> {
    vec![
        ("RA",Value::Float(30.0)),
        ("Dec",Value::Float(-13.2)),
        ("B",Value::Float(12.5))
    ]
}

fn expect_float(value: Value) -> f64 {
    match value {
        Value::Float(v) => v,
        other => panic!("expected a float, got {:?}",other)
    }
}

#[test]
fn level0_single_record() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("stars.dat");
    let mut writer = StarWriter::new(Some(&output),&dir.path().join("chunks"),8,
        &StarLayout::Custom(scenario_fields())).expect("writer");
    writer.set_maglim(12.5);
    {
        let mut session = writer.container().trixel_writer(3,true).expect("session");
        session.add(&scenario_values()).expect("add");
        session.commit().expect("commit");
    }
    writer.finish().expect("finish");

    let reader = StarReader::open(&output).expect("open");
    assert_eq!(reader.htm_level(),0);
    assert_eq!(reader.max_records(),1);
    assert!((reader.maglim(1000) - 12.5).abs() < 1e-3);
    let inner = reader.reader();
    assert_eq!(inner.trixel_count(),8);
    for i in 0..8 {
        let trixel = inner.trixel(i).expect("trixel");
        assert_eq!(trixel.id() as usize,i);
        match i {
            3 => assert_eq!(trixel.len(),1),
            _ => assert_eq!(trixel.len(),0)
        }
    }
    let rec = inner.trixel(3).unwrap().record(0).expect("record");
    assert!((expect_float(rec.get("RA").unwrap()) - 30.0).abs() < 1e-6);
    assert!((expect_float(rec.get("Dec").unwrap()) + 13.2).abs() < 1e-5);
    assert!((expect_float(rec.get("B").unwrap()) - 12.5).abs() < 1e-3);
}

#[test]
fn records_come_back_in_input_order() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("ordered.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    for trixel in [1u32,6] {
        let mut session = writer.trixel_writer(trixel,true).expect("session");
        for i in 0..10 {
            session.add(&[("seq",Value::Int(trixel as i64 * 100 + i))]).expect("add");
        }
        session.commit().expect("commit");
    }
    writer.finish().expect("finish");

    let reader = Reader::open(&output).expect("open");
    assert_eq!(reader.trixel_count(),8);
    for trixel in reader.trixels() {
        let base = trixel.id() as i64 * 100;
        if trixel.id()==1 || trixel.id()==6 {
            assert_eq!(trixel.len(),10);
            for (i,rec) in trixel.records().enumerate() {
                assert_eq!(rec.unwrap().get("seq").unwrap(),Value::Int(base + i as i64));
            }
        } else {
            assert!(trixel.is_empty());
        }
    }
}

#[test]
fn schema_freezes_after_packer() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let mut writer = ContainerWriter::new(&dir.path().join("x.dat"),&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("a",DataType::Int16,2,0).unwrap()).expect("field");
    let _ = writer.record_packer();
    assert!(writer.add_field(FieldDescriptor::new("b",DataType::Int16,2,0).unwrap()).is_err());
}

#[test]
fn version_2_is_rejected() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("v2.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("a",DataType::Int16,2,0).unwrap()).expect("field");
    writer.finish().expect("finish");

    let mut fd = std::fs::OpenOptions::new().write(true).open(&output).expect("reopen");
    fd.seek(SeekFrom::Start(126)).expect("seek");
    fd.write_all(&[2]).expect("patch");
    drop(fd);

    let err = Reader::open(&output).expect_err("should reject version 2");
    assert!(err.to_string().contains("version 2"),"unexpected error: {}",err);
}

#[test]
fn bad_byte_order_marker_is_rejected() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("marker.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("a",DataType::Int16,2,0).unwrap()).expect("field");
    writer.finish().expect("finish");

    let mut fd = std::fs::OpenOptions::new().write(true).open(&output).expect("reopen");
    fd.seek(SeekFrom::Start(124)).expect("seek");
    fd.write_all(b"ZZ").expect("patch");
    drop(fd);

    let err = Reader::open(&output).expect_err("should reject marker");
    assert!(err.to_string().contains("byte-order"),"unexpected error: {}",err);
}

#[test]
fn unknown_type_code_is_rejected() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("badtype.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("a",DataType::Int16,2,0).unwrap()).expect("field");
    writer.finish().expect("finish");

    // type code byte of the first field entry: 124+2+1+2 (count) + 10 (name) + 1 (width)
    let mut fd = std::fs::OpenOptions::new().write(true).open(&output).expect("reopen");
    fd.seek(SeekFrom::Start(140)).expect("seek");
    fd.write_all(&[99]).expect("patch");
    drop(fd);

    let err = Reader::open(&output).expect_err("should reject type code");
    assert!(err.to_string().contains("type code"),"unexpected error: {}",err);
}

#[test]
fn missing_trixels_are_materialized_empty() {
    init_log();
    // declare 8 trixels but register chunks for only 4 of them
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("partial.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    for trixel in [0u32,1,2,5] {
        let mut session = writer.trixel_writer(trixel,true).expect("session");
        session.add(&[("seq",Value::Int(trixel as i64))]).expect("add");
        session.commit().expect("commit");
    }
    writer.finish().expect("finish");

    let reader = Reader::open(&output).expect("open");
    assert_eq!(reader.trixel_count(),8);
    for trixel in reader.trixels() {
        match trixel.id() {
            0 | 1 | 2 | 5 => assert_eq!(trixel.len(),1),
            _ => {
                assert_eq!(trixel.len(),0);
                assert!(trixel.offset() > 0,"offset must be backfilled even for empty trixels");
            }
        }
    }
}

#[test]
fn index_invariant_offsets_span_chunk_bytes() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("invariant.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    for field in scenario_fields() {
        writer.add_field(field).expect("field");
    }
    let mut session = writer.trixel_writer(3,true).expect("session");
    session.add(&scenario_values()).expect("add");
    session.commit().expect("commit");
    writer.finish().expect("finish");

    // the same record packed independently must appear verbatim at the offset
    let schema = Schema::from_fields(scenario_fields()).unwrap();
    let expected = RecordPacker::new(&schema,ByteOrder::Little).pack(&scenario_values()).unwrap();

    let reader = Reader::open(&output).expect("open");
    let trixel = reader.trixel(3).expect("trixel");
    let mut fd = std::fs::File::open(&output).expect("raw open");
    fd.seek(SeekFrom::Start(trixel.offset() as u64)).expect("seek");
    let mut actual = vec![0u8;trixel.len() * reader.record_size()];
    fd.read_exact(&mut actual).expect("read payload");
    assert_eq!(actual,expected);
}

#[test]
fn unsorted_writer_keeps_registration_order() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("unsorted.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.set_sort_trixels(false);
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    for trixel in [5u32,2,7] {
        let mut session = writer.trixel_writer(trixel,true).expect("session");
        session.add(&[("seq",Value::Int(trixel as i64))]).expect("add");
        session.commit().expect("commit");
    }
    writer.finish().expect("finish");

    let reader = Reader::open(&output).expect("open");
    let head: Vec<u32> = (0..3).map(|i| reader.trixel(i).unwrap().id()).collect();
    assert_eq!(head,vec![5,2,7]);
}

#[test]
fn big_endian_container_reads_back() {
    // hand-built big-endian container with one field and one record
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("big.dat");
    let mut bytes: Vec<u8> = Vec::new();
    let mut description = b"big endian test".to_vec();
    description.resize(124,0);
    bytes.extend_from_slice(&description);
    bytes.extend_from_slice(b"KS");
    bytes.push(1);
    bytes.extend_from_slice(&1u16.to_be_bytes());
    let mut name = b"val".to_vec();
    name.resize(10,0);
    bytes.extend_from_slice(&name);
    bytes.push(4);
    bytes.push(DataType::Int32.code());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&1u32.to_be_bytes());
    // one descriptor: id 0, payload right after the table, one record
    let offset = bytes.len() as u32 + 12;
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&(-5i32).to_be_bytes());
    std::fs::write(&output,&bytes).expect("write");

    let reader = Reader::open(&output).expect("open");
    assert_eq!(reader.byte_order(),ByteOrder::Big);
    assert_eq!(reader.description(),"big endian test");
    let rec = reader.trixel(0).unwrap().record(0).expect("record");
    assert_eq!(rec.get("val").unwrap(),Value::Int(-5));
}

#[test]
fn truncated_payload_is_a_corrupt_read() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("short.dat");
    let mut writer = ContainerWriter::new(&output,&dir.path().join("chunks"),8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    let mut session = writer.trixel_writer(0,true).expect("session");
    session.add(&[("seq",Value::Int(7))]).expect("add");
    session.commit().expect("commit");
    writer.finish().expect("finish");

    // chop two bytes off the payload
    let full = std::fs::read(&output).expect("read");
    std::fs::write(&output,&full[0..full.len()-2]).expect("truncate");

    let reader = Reader::open(&output).expect("open");
    let err = reader.trixel(0).unwrap().record(0).expect_err("short read must fail");
    assert!(err.to_string().contains("short read"),"unexpected error: {}",err);
}

#[test]
fn failed_assembly_preserves_chunks_and_writes_nothing() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let chunk_dir = dir.path().join("chunks");
    let output = dir.path().join("doomed.dat");
    let mut writer = ContainerWriter::new(&output,&chunk_dir,8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    let mut session = writer.trixel_writer(4,true).expect("session");
    session.add(&[("seq",Value::Int(1))]).expect("add");
    session.commit().expect("commit");

    // corrupt the chunk behind the writer's back so assembly trips the
    // divisibility check
    let chunk_path = chunk_dir.join("trixel000000000004.dat");
    let mut fd = std::fs::OpenOptions::new().append(true).open(&chunk_path).expect("reopen chunk");
    fd.write_all(&[0xff]).expect("corrupt");
    drop(fd);

    assert!(writer.finish().is_err());
    assert!(!output.exists(),"no partial container may be left behind");
    assert!(chunk_path.exists(),"chunk files must be preserved for inspection");
}

#[test]
fn trixel_dir_reader_sees_unassembled_chunks() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let chunk_dir = dir.path().join("chunks");
    let mut writer = ContainerWriter::chunks_only(&chunk_dir,8).expect("writer");
    for field in scenario_fields() {
        writer.add_field(field).expect("field");
    }
    let mut session = writer.trixel_writer(2,true).expect("session");
    session.add(&scenario_values()).expect("add");
    session.commit().expect("commit");
    writer.finish().expect("finish leaves chunks in place");

    let reader = TrixelDirReader::open(&chunk_dir,Schema::from_fields(scenario_fields()).unwrap()).expect("open dir");
    assert_eq!(reader.trixel_ids(),vec![2]);
    let trixel = reader.trixel(2).expect("trixel");
    assert_eq!(trixel.len(),1);
    let rec = trixel.record(0).expect("record");
    assert!((expect_float(rec.get("RA").unwrap()) - 30.0).abs() < 1e-6);
}

#[test]
fn manual_registration_claims_external_chunk() {
    // a chunk produced out of band can be registered by path
    let dir = tempfile::tempdir().expect("no temp dir");
    let output = dir.path().join("claimed.dat");
    let chunk_dir = dir.path().join("chunks");
    std::fs::create_dir_all(&chunk_dir).expect("mkdir");
    let external = chunk_dir.join("trixel000000000006.dat");
    std::fs::write(&external,7i32.to_le_bytes()).expect("external chunk");

    let mut writer = ContainerWriter::new(&output,&chunk_dir,8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    writer.register_chunk(TrixelDescriptor::new(6,0,1),Some(Path::new(&external))).expect("register");
    writer.finish().expect("finish");

    let reader = Reader::open(&output).expect("open");
    assert_eq!(reader.trixel(6).unwrap().record(0).unwrap().get("seq").unwrap(),Value::Int(7));
    assert!(external.exists(),"claimed chunks are never auto-deleted");
}
