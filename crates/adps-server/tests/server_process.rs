//! Launches the server binary and drives it over TCP.

use adps_core::client::NetClient;
use adps_core::net::SocketClient;
use adps_core::stats::RunningStatistics;
use adps_core::store::{FuncStats, StatsUpdate};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn spawn_server(temp: &TempDir, extra: &[&str]) -> (Child, String) {
    let output = temp.path().join("parameters.txt");
    let mut child = Command::new(env!("CARGO_BIN_EXE_adps-server"))
        .arg("2")
        .arg(&output)
        .args(["--addr", "tcp://127.0.0.1:0"])
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to launch adps-server");

    let stdout = child.stdout.take().expect("stdout is piped");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("failed to read server address");
    let addr = line
        .trim()
        .strip_prefix("PS_ADDR=")
        .unwrap_or_else(|| panic!("unexpected first line: {:?}", line))
        .to_string();
    (child, addr)
}

fn wait_for_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("server did not exit after quit");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_add_then_quit_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let (mut child, addr) = spawn_server(&temp, &[]);

    let mut client = NetClient::new(Box::new(SocketClient::new()));
    client.connect(0, 0, &addr).unwrap();

    let mut update = StatsUpdate::new(0, Some(1));
    let mut f = FuncStats::new("MPI_Allreduce");
    f.inclusive = RunningStatistics::from_samples([1.0, 2.0, 3.0]);
    f.exclusive = RunningStatistics::from_samples([0.5, 1.0, 1.5]);
    f.anomaly_count = 1;
    update.functions.insert(7, f);

    let global = client.add_stats(&update).unwrap();
    assert_eq!(global.get(7).unwrap().inclusive.count(), 3);

    client.disconnect().unwrap();
    assert!(wait_for_exit(&mut child).success());

    let table = std::fs::read_to_string(temp.path().join("parameters.txt")).unwrap();
    let mut lines = table.lines();
    assert!(lines.next().unwrap().starts_with("# id"));
    let row: Vec<&str> = lines.next().unwrap().split('\t').collect();
    assert_eq!(row[0], "7");
    assert_eq!(row[1], "MPI_Allreduce");
    assert_eq!(row[2], "3");
    assert_eq!(row[3], "2.000000");
    assert_eq!(row[7], "1");
}

#[test]
fn test_snapshot_written_on_exit() {
    let temp = TempDir::new().unwrap();
    let snapshot = temp.path().join("snap.json");
    let snapshot_arg = snapshot.to_string_lossy().into_owned();
    let (mut child, addr) = spawn_server(
        &temp,
        &["--snapshot-interval", "3600", "--snapshot-file", &snapshot_arg],
    );

    let mut client = NetClient::new(Box::new(SocketClient::new()));
    client.connect(0, 0, &addr).unwrap();
    assert!(client.get_global().unwrap().is_empty());
    client.disconnect().unwrap();

    assert!(wait_for_exit(&mut child).success());
    let snap = adps_core::snapshot::read_snapshot(&snapshot).unwrap().unwrap();
    assert!(snap.functions.is_empty());
}
