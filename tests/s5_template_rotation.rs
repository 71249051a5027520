use std::time::Duration;

use nodecore_sync::{BlockTemplate, ReportOutcome, WorkCoordinator};

fn template(fp: &str) -> BlockTemplate {
    BlockTemplate { fingerprint: fp.to_string(), difficulty: 1, target: [0xff; 32] }
}

#[test]
fn rotating_the_template_clears_the_completed_range_set() {
    let coordinator = WorkCoordinator::new(Duration::from_secs(30));
    coordinator.set_template(template("T1"));

    let first = coordinator.assign_work("w1", 100).unwrap().unwrap();
    assert_eq!((first.nonce_start, first.nonce_end), (0, 100));
    coordinator.report_result("w1", ReportOutcome::Exhausted).unwrap();

    coordinator.set_template(template("T2"));
    let second = coordinator.assign_work("w1", 100).unwrap().unwrap();
    assert_eq!((second.nonce_start, second.nonce_end), (0, 100), "a new template must reissue [0,100) rather than continue where T1 left off");
}
