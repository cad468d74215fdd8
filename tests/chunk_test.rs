// test of chunk sessions: append laws, locking, failure cleanup
use skybin::codec::{DataType,Value};
use skybin::schema::FieldDescriptor;
use skybin::container::ContainerWriter;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seq_writer(dir: &std::path::Path,name: &str) -> ContainerWriter {
    let mut writer = ContainerWriter::new(&dir.join(name),&dir.join(format!("{}_chunks",name)),8).expect("writer");
    writer.add_field(FieldDescriptor::new("seq",DataType::Int32,4,0).unwrap()).expect("field");
    writer
}

#[test]
fn append_law_two_sessions_equal_one() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");

    // write A then B in two append sessions
    let split = seq_writer(dir.path(),"split");
    {
        let mut session = split.trixel_writer(5,true).expect("session");
        for i in 0..7 {
            session.add(&[("seq",Value::Int(i))]).expect("add");
        }
        session.commit().expect("commit");
    }
    {
        let mut session = split.trixel_writer(5,true).expect("session");
        assert_eq!(session.len(),7,"count must be re-read at session start");
        for i in 7..12 {
            session.add(&[("seq",Value::Int(i))]).expect("add");
        }
        session.commit().expect("commit");
    }
    assert_eq!(split.registered_count(5),12);

    // write A ++ B in one session
    let whole = seq_writer(dir.path(),"whole");
    {
        let mut session = whole.trixel_writer(5,true).expect("session");
        for i in 0..12 {
            session.add(&[("seq",Value::Int(i))]).expect("add");
        }
        session.commit().expect("commit");
    }

    let split_bytes = std::fs::read(split.chunk_path(5)).expect("split chunk");
    let whole_bytes = std::fs::read(whole.chunk_path(5)).expect("whole chunk");
    assert_eq!(split_bytes,whole_bytes);
}

#[test]
fn fresh_session_requires_absent_file() {
    let dir = tempfile::tempdir().expect("no temp dir");
    let writer = seq_writer(dir.path(),"fresh");
    {
        let mut session = writer.trixel_writer(2,false).expect("first exclusive session");
        session.add(&[("seq",Value::Int(1))]).expect("add");
        session.commit().expect("commit");
    }
    let err = writer.trixel_writer(2,false).expect_err("second exclusive session must fail");
    assert!(err.to_string().contains("already exists"),"unexpected error: {}",err);
    // append is still allowed
    let session = writer.trixel_writer(2,true).expect("append session");
    assert_eq!(session.len(),1);
    session.commit().expect("commit");
}

#[test]
fn uncommitted_session_removes_chunk_and_registers_nothing() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let writer = seq_writer(dir.path(),"failed");
    {
        let mut session = writer.trixel_writer(3,true).expect("session");
        session.add(&[("seq",Value::Int(9))]).expect("add");
        // dropped without commit, simulating an error path
    }
    assert!(!writer.chunk_path(3).exists(),"failed session must remove its file");
    assert_eq!(writer.registered_count(3),0);
}

#[test]
fn concurrent_sessions_serialize_whole_records() {
    init_log();
    let dir = tempfile::tempdir().expect("no temp dir");
    let writer = seq_writer(dir.path(),"racing");
    let per_worker = 100;

    std::thread::scope(|scope| {
        for worker in 0..2i64 {
            let writer = &writer;
            scope.spawn(move || {
                let mut session = writer.trixel_writer(5,true).expect("session");
                for i in 0..per_worker {
                    session.add(&[("seq",Value::Int(worker * 1000 + i))]).expect("add");
                }
                session.commit().expect("commit");
            });
        }
    });

    let record_size = 4;
    let bytes = std::fs::read(writer.chunk_path(5)).expect("chunk");
    assert_eq!(bytes.len(),2 * per_worker as usize * record_size);
    assert_eq!(writer.registered_count(5),2 * per_worker as u32);

    // no mid-record interleaving: every record is one worker's value
    let mut counts = [0,0];
    for rec in bytes.chunks(record_size) {
        let val = i32::from_le_bytes(rec.try_into().unwrap()) as i64;
        let worker = val / 1000;
        assert!(worker==0 || worker==1,"corrupted record value {}",val);
        assert!((0..per_worker).contains(&(val % 1000)));
        counts[worker as usize] += 1;
    }
    assert_eq!(counts,[per_worker,per_worker]);

    // each worker's records stay in call order within its own block
    let mut last = [-1i64,-1i64];
    for rec in bytes.chunks(record_size) {
        let val = i32::from_le_bytes(rec.try_into().unwrap()) as i64;
        let worker = (val / 1000) as usize;
        assert!(val % 1000 > last[worker],"records of one session must not reorder");
        last[worker] = val % 1000;
    }
}
