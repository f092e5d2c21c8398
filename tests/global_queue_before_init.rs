use fiber_job_manager::global;

#[test]
#[should_panic(expected = "before global::init")]
fn test_queue_before_init_is_fatal() {
    let _ = global::queue(|| {});
}
