//! Process lifecycle and library map reporting
//!
//! These run outside the allocation hot path. Each one is gated on the
//! collector being connected and returns the send status to the caller,
//! which decides whether a failure should drop the connection.

use tracing::warn;

use crate::error::{ReportError, Result};
use crate::protocol::{
    attached_payload, map_payload, pid_payload, InfoRecord, Operation,
};
use crate::reporter::Reporter;
use crate::task::{Library, Task};
use crate::transport::Sink;

impl<S: Sink> Reporter<S> {
    fn send_checked(&mut self, op: Operation, pid: u32, payload: &[u8]) -> Result<()> {
        if !self.sink.connected() {
            return Err(ReportError::NotConnected);
        }
        self.sink.send(op, pid, payload)?;
        Ok(())
    }

    /// Announce a traced process; `was_attached` tells the collector the
    /// process was already running rather than launched by the tracer
    pub fn report_attach<T: Task + ?Sized>(&mut self, task: &T, was_attached: bool) -> Result<()> {
        let op = if task.is_64bit() {
            Operation::Attach64
        } else {
            Operation::Attach
        };
        self.send_checked(op, task.tid(), &attached_payload(was_attached))
    }

    pub fn report_fork<T: Task + ?Sized, P: Task + ?Sized>(&mut self, task: &T, parent: &P) -> Result<()> {
        self.send_checked(Operation::Fork, task.tid(), &pid_payload(parent.leader_tid()))
    }

    pub fn report_exit<T: Task + ?Sized>(&mut self, task: &T) -> Result<()> {
        self.send_checked(Operation::Exit, task.tid(), &[])
    }

    pub fn report_about_exit<T: Task + ?Sized>(&mut self, task: &T) -> Result<()> {
        self.send_checked(Operation::AboutExit, task.tid(), &[])
    }

    pub fn report_nofollow<T: Task + ?Sized>(&mut self, task: &T) -> Result<()> {
        self.send_checked(Operation::NoFollow, task.tid(), &[])
    }

    pub fn report_detach<T: Task + ?Sized>(&mut self, task: &T) -> Result<()> {
        self.send_checked(Operation::Detach, task.tid(), &[])
    }

    pub fn report_disconnect(&mut self) -> Result<()> {
        self.send_checked(Operation::Disconnect, 0, &[])
    }

    pub fn report_add_map<T: Task + ?Sized>(&mut self, task: &T, lib: &Library) -> Result<()> {
        self.report_map(task, lib, Operation::AddMap)
    }

    pub fn report_del_map<T: Task + ?Sized>(&mut self, task: &T, lib: &Library) -> Result<()> {
        self.report_map(task, lib, Operation::DelMap)
    }

    fn report_map<T: Task + ?Sized>(&mut self, task: &T, lib: &Library, op: Operation) -> Result<()> {
        let payload = map_payload(task.width(), lib);
        self.send_checked(op, task.tid(), &payload)
    }

    /// Forward raw scan data for a process
    pub fn report_scan(&mut self, pid: u32, data: &[u8]) -> Result<()> {
        self.send_checked(Operation::Scan, pid, data)
    }

    /// Send the configuration and timing snapshot
    pub fn report_info(&mut self, do_trace: bool) -> Result<()> {
        let info = InfoRecord {
            mode: self.options.mode(),
            do_trace,
            stack_depth: self.options.bt_depth,
            verbose: self.options.verbose,
        };
        let payload = info.encode(&self.timers);
        self.send_checked(Operation::Info, 0, &payload)
    }

    /// Resynchronize a collector: attach plus every loaded library, for
    /// each process leader
    pub fn report_processes<'a, T, I>(&mut self, leaders: I) -> Result<()>
    where
        T: Task + ?Sized + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        if !self.sink.connected() {
            return Err(ReportError::NotConnected);
        }

        for leader in leaders {
            if let Err(e) = self.report_attach(leader, true) {
                warn!(pid = leader.tid(), error = %e, "attach record not sent");
            }
            for lib in leader.libraries() {
                if let Err(e) = self.report_add_map(leader, lib) {
                    warn!(pid = leader.tid(), lib = %lib.path.display(), error = %e, "map record not sent");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportOptions;
    use crate::error::TransportError;
    use crate::protocol::{INFO_LEN, INFO_VERSION, MODE_FOLLOW_FORK};
    use crate::task::LibraryKind;
    use crate::testing::ScriptedTask;
    use crate::transport::MemorySink;
    use std::path::PathBuf;

    fn lib(path: &str, vaddr: u64) -> Library {
        Library {
            path: PathBuf::from(path),
            txt_vaddr: vaddr,
            txt_offset: 0x1000,
            txt_size: 0x2000,
            bias: vaddr - 0x1000,
            kind: LibraryKind::Library,
        }
    }

    fn reporter() -> Reporter<MemorySink> {
        Reporter::new(ReportOptions::default(), MemorySink::new())
    }

    #[test]
    fn test_everything_fails_when_disconnected() {
        let mut r = Reporter::new(ReportOptions::default(), MemorySink::disconnected());
        let task = ScriptedTask::new_64();
        assert!(matches!(r.report_exit(&task), Err(ReportError::NotConnected)));
        assert!(matches!(r.report_info(false), Err(ReportError::NotConnected)));
        assert!(matches!(r.report_disconnect(), Err(ReportError::NotConnected)));
        assert!(matches!(
            r.report_processes([&task]),
            Err(ReportError::NotConnected)
        ));
    }

    #[test]
    fn test_attach_kind_follows_width() {
        let mut r = reporter();
        r.report_attach(&ScriptedTask::new_64(), true).unwrap();
        r.report_attach(&ScriptedTask::new_32(), false).unwrap();

        let msgs = r.sink().messages();
        assert_eq!(msgs[0].operation, Operation::Attach64);
        assert_eq!(msgs[0].payload, vec![1]);
        assert_eq!(msgs[1].operation, Operation::Attach);
        assert_eq!(msgs[1].payload, vec![0]);
    }

    #[test]
    fn test_fork_carries_parent_leader() {
        let mut r = reporter();
        let parent = ScriptedTask::new_64().with_ids(51, 50);
        let child = ScriptedTask::new_64().with_ids(60, 60);
        r.report_fork(&child, &parent).unwrap();

        let msg = &r.sink().messages()[0];
        assert_eq!(msg.operation, Operation::Fork);
        assert_eq!(msg.pid, 60);
        assert_eq!(msg.payload, 50u32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_empty_lifecycle_records() {
        let mut r = reporter();
        let task = ScriptedTask::new_64().with_ids(7, 7);
        r.report_exit(&task).unwrap();
        r.report_about_exit(&task).unwrap();
        r.report_nofollow(&task).unwrap();
        r.report_detach(&task).unwrap();
        r.report_disconnect().unwrap();

        assert_eq!(
            r.sink().operations(),
            vec![
                Operation::Exit,
                Operation::AboutExit,
                Operation::NoFollow,
                Operation::Detach,
                Operation::Disconnect
            ]
        );
        assert!(r.sink().messages().iter().all(|m| m.payload.is_empty()));
        assert_eq!(r.sink().messages()[4].pid, 0);
    }

    #[test]
    fn test_map_records() {
        let mut r = reporter();
        let task = ScriptedTask::new_32().with_ids(9, 9);
        let l = lib("/lib/libc.so.6", 0x4000_1000);
        r.report_add_map(&task, &l).unwrap();
        r.report_del_map(&task, &l).unwrap();

        let msgs = r.sink().messages();
        assert_eq!(msgs[0].operation, Operation::AddMap);
        assert_eq!(msgs[1].operation, Operation::DelMap);
        assert_eq!(msgs[0].payload.len(), 16 + "/lib/libc.so.6".len() + 1);
    }

    #[test]
    fn test_info_snapshot() {
        let mut r = Reporter::new(
            ReportOptions::default().with_bt_depth(12).with_follow(true, false),
            MemorySink::new(),
        );
        r.report_info(true).unwrap();

        let msg = &r.sink().messages()[0];
        assert_eq!(msg.operation, Operation::Info);
        assert_eq!(msg.pid, 0);
        assert_eq!(msg.payload.len(), INFO_LEN);
        assert_eq!(&msg.payload[..5], &[INFO_VERSION, MODE_FOLLOW_FORK, 1, 12, 0]);
    }

    #[test]
    fn test_scan_passes_data_through() {
        let mut r = reporter();
        r.report_scan(33, b"scan-block").unwrap();
        let msg = &r.sink().messages()[0];
        assert_eq!(msg.operation, Operation::Scan);
        assert_eq!(msg.pid, 33);
        assert_eq!(msg.payload, b"scan-block".to_vec());
    }

    #[test]
    fn test_report_processes_sends_attach_then_maps() {
        let mut r = reporter();
        let a = ScriptedTask::new_64()
            .with_ids(10, 10)
            .with_library(lib("/bin/a", 0x1000))
            .with_library(lib("/lib/libc.so.6", 0x7000_1000));
        let b = ScriptedTask::new_64().with_ids(20, 20);

        r.report_processes([&a, &b]).unwrap();
        assert_eq!(
            r.sink().operations(),
            vec![
                Operation::Attach64,
                Operation::AddMap,
                Operation::AddMap,
                Operation::Attach64
            ]
        );
        assert_eq!(r.sink().messages()[0].payload, vec![1]);
        assert_eq!(r.sink().messages()[3].pid, 20);
    }

    #[test]
    fn test_transport_failure_surfaces() {
        let mut r = reporter();
        r.sink_mut().set_fail_sends(true);
        let err = r.report_exit(&ScriptedTask::new_64()).unwrap_err();
        assert!(matches!(err, ReportError::Transport(TransportError::Io(_))));

        // snapshot keeps going past failed items
        assert!(r.report_processes([&ScriptedTask::new_64()]).is_ok());
    }
}
