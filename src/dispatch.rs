//! Walks a device's dialects until one of them carries the command.
//!
//! Each attempt goes SELECT, TRANSLATE, SUBMIT, CLASSIFY. A soft failure
//! (the dialect itself doesn't work for this device) demotes the dialect and
//! moves on; success or a hard failure (the device answered) ends the walk.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::buffer::{self, BufferLimits};
use crate::config::{Config, DispatchConfig};
use crate::context::{CommandContext, ProtocolCompletion};
use crate::error::DispatchError;
use crate::io::{Clock, DeviceId, DeviceIo, Handle, MonotonicClock, RawCompletion, RawStatus, SubmitRequest};
use crate::probe;
use crate::profile::DeviceProfile;
use crate::translate::{self, TranslateEnv, TranslationTable, TransportOutcome};
use crate::transport::WireCommand;

/// What to do after one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// The device answered; map the completion back.
    Done,
    /// The dialect didn't work; try the next one.
    Soft { negative_cache: bool },
}

fn classify(
    raw: &RawCompletion,
    outcome: TransportOutcome,
    command: &WireCommand,
    config: &DispatchConfig,
) -> Verdict {
    match raw.status {
        // A translating layer refusing the opcode it was handed means the
        // translation isn't supported there, not that the device said no.
        RawStatus::Completed
            if outcome == TransportOutcome::InvalidCommand && command.is_translated() =>
        {
            Verdict::Soft {
                negative_cache: true,
            }
        }
        RawStatus::Completed => Verdict::Done,
        RawStatus::NotImplemented | RawStatus::SignatureMismatch | RawStatus::Rejected => {
            Verdict::Soft {
                negative_cache: true,
            }
        }
        RawStatus::TimedOut if config.retry_on_timeout => Verdict::Soft {
            negative_cache: false,
        },
        RawStatus::TimedOut | RawStatus::LinkError => Verdict::Done,
    }
}

/// Everything one dispatch needs, borrowed.
pub(crate) struct Dispatcher<'a> {
    pub io: &'a dyn DeviceIo,
    pub handle: Handle,
    pub profile: &'a DeviceProfile,
    pub table: &'a TranslationTable,
    pub config: &'a DispatchConfig,
    pub clock: &'a dyn Clock,
}

impl Dispatcher<'_> {
    pub fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<ProtocolCompletion, DispatchError> {
        let protocol = ctx.protocol();
        let budget = ctx.timeout().unwrap_or_else(|| self.config.default_timeout());
        let env = TranslateEnv::for_profile(self.profile);
        let mut attempted = Vec::new();
        let mut started: Option<Instant> = None;

        for descriptor in self.profile.dispatch_order() {
            let dialect = descriptor.dialect;
            attempted.push(dialect);

            let command = match translate::forward(self.table, ctx, descriptor, &env) {
                Ok(command) => command,
                Err(e) => {
                    debug!(%dialect, reason = e.reason, "no translation for this dialect");
                    continue;
                }
            };

            let bytes = match (descriptor.encode)(&command) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    warn!(%dialect, reason, "command rejected by the dialect's framing");
                    continue;
                }
            };

            // The first submission gets the whole budget; fallbacks get what is left.
            let remaining = match started {
                None => {
                    started = Some(self.clock.now());
                    budget
                }
                Some(start) => budget.saturating_sub(self.clock.elapsed_since(start)),
            };
            if remaining.is_zero() {
                warn!(%dialect, ?budget, "timeout budget spent before the next attempt");
                return Ok(translate::synthesize(protocol, TransportOutcome::Timeout, 0));
            }

            let limits = BufferLimits::for_transport(self.profile, descriptor);
            let mut prepared = match buffer::prepare(&limits, ctx.data_mut(), &command) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(%dialect, error = %e, "buffer layout rejected by dialect");
                    continue;
                }
            };

            debug!(
                %dialect,
                rule = command.rule.unwrap_or("identity"),
                len = command.transfer_len,
                ?remaining,
                "submitting"
            );
            let raw = self.io.submit(
                self.handle,
                SubmitRequest {
                    dialect,
                    command: &bytes,
                    data: prepared.as_io(),
                    timeout: remaining,
                },
            );
            let outcome = translate::outcome(&raw);

            match classify(&raw, outcome, &command, self.config) {
                Verdict::Done => {
                    prepared.commit(outcome.is_success(), raw.transferred);
                    debug!(%dialect, ?outcome, "completed");
                    return Ok(translate::reverse(protocol, &raw, outcome, &command));
                }
                Verdict::Soft { negative_cache } => {
                    drop(prepared);
                    warn!(%dialect, status = ?raw.status, ?outcome, "soft transport failure");
                    if negative_cache && self.config.negative_cache && self.profile.demote(dialect) {
                        warn!(%dialect, "dialect demoted for this device");
                    }
                }
            }
        }

        Err(DispatchError::NoViableTransport {
            protocol,
            attempted,
        })
    }
}

/// An open device: its handle, its profile and the means to run commands.
///
/// The handle is closed when the session is dropped. `execute` takes `&self`
/// and may be called from several threads at once.
pub struct DeviceSession {
    io: Arc<dyn DeviceIo>,
    handle: Handle,
    profile: DeviceProfile,
    table: Arc<TranslationTable>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("handle", &self.handle)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Opens and classifies a device with the standard translation table.
    pub fn open(io: Arc<dyn DeviceIo>, id: &DeviceId, config: &Config) -> Result<Self, DispatchError> {
        Self::open_with(io, id, config, Arc::new(TranslationTable::standard()))
    }

    #[tracing::instrument(skip(io, config, table))]
    pub fn open_with(
        io: Arc<dyn DeviceIo>,
        id: &DeviceId,
        config: &Config,
        table: Arc<TranslationTable>,
    ) -> Result<Self, DispatchError> {
        let handle = io.open(id)?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let profile = match probe::classify(io.as_ref(), handle, &table, &config.probe, clock.as_ref()) {
            Ok(profile) => profile,
            Err(e) => {
                io.close(handle);
                return Err(e.into());
            }
        };
        info!(
            family = ?profile.family(),
            conservative = profile.is_conservative(),
            primary = ?profile.primary().map(|d| d.dialect),
            "device classified"
        );
        Ok(Self {
            io,
            handle,
            profile,
            table,
            config: config.dispatch.clone(),
            clock,
        })
    }

    /// Wraps an already classified device.
    pub fn from_profile(
        io: Arc<dyn DeviceIo>,
        handle: Handle,
        profile: DeviceProfile,
        table: Arc<TranslationTable>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            io,
            handle,
            profile,
            table,
            config,
            clock: Arc::new(MonotonicClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Runs one command. Device-side failures, timeouts included, come back
    /// as a completion in the command's own protocol; `Err` means no dialect
    /// could carry it at all.
    #[tracing::instrument(
        skip_all,
        fields(protocol = ?ctx.protocol(), opcode = ctx.command().opcode())
    )]
    pub fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<ProtocolCompletion, DispatchError> {
        self.dispatcher().execute(ctx)
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            io: self.io.as_ref(),
            handle: self.handle,
            profile: &self.profile,
            table: &self.table,
            config: &self.config,
            clock: self.clock.as_ref(),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.io.close(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use super::*;
    use crate::ata::{AtaRegisters, TaskFile};
    use crate::context::{DataBuffer, Protocol};
    use crate::io::{AdapterCaps, BusInfo, BusType, NativeStatus};
    use crate::mock::ScriptedIo;
    use crate::nvme::{self, DsmRange, NvmeCommand};
    use crate::profile::ProtocolFamily;
    use crate::scsi::command::{self as cdb, UnmapList};
    use crate::scsi::{self, OpCode, SenseData};
    use crate::transport::Dialect;

    fn session(io: &Arc<ScriptedIo>, family: ProtocolFamily, config: DispatchConfig) -> DeviceSession {
        let profile = DeviceProfile::new(family, io.bus_info(), false);
        DeviceSession::from_profile(
            io.clone(),
            Handle(1),
            profile,
            Arc::new(TranslationTable::standard()),
            config,
        )
    }

    fn ata_and_scsi_bus() -> BusInfo {
        BusInfo {
            bus_type: BusType::Sata,
            adapter: AdapterCaps {
                ata_passthrough: true,
                scsi_passthrough: true,
                block_io: false,
                ..AdapterCaps::default()
            },
        }
    }

    fn scsi_only_bus() -> BusInfo {
        BusInfo {
            bus_type: BusType::Scsi,
            adapter: AdapterCaps {
                scsi_passthrough: true,
                block_io: false,
                ..AdapterCaps::default()
            },
        }
    }

    fn ready() -> RawCompletion {
        RawCompletion::native(NativeStatus::Ata(AtaRegisters::ready()), 0)
    }

    #[test]
    fn soft_failure_falls_back_and_is_remembered() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::GOOD,
                    sense: Vec::new(),
                },
                512,
            ),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());

        let mut buf = [0u8; 512];
        let mut ctx = CommandContext::ata(TaskFile::identify_device(), DataBuffer::In(&mut buf));
        let completion = session.execute(&mut ctx).expect("second dialect works");
        assert!(completion.is_success());
        assert_eq!(completion.protocol(), Protocol::Ata);
        assert_eq!(
            io.dialects(),
            vec![Dialect::AtaPassThrough, Dialect::ScsiPassThrough]
        );
        assert!(session.profile().is_demoted(Dialect::AtaPassThrough));

        io.clear();
        let mut ctx = CommandContext::ata(TaskFile::identify_device(), DataBuffer::In(&mut buf));
        session.execute(&mut ctx).expect("goes straight to the working dialect");
        assert_eq!(io.dialects(), vec![Dialect::ScsiPassThrough]);
    }

    #[test]
    fn hard_failure_ends_dispatch() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |_| {
            RawCompletion::native(
                NativeStatus::Ata(AtaRegisters::new(0x51, crate::ata::error::UNC)),
                0,
            )
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut buf = [0u8; 512];
        let mut ctx = CommandContext::ata(TaskFile::read_dma_ext(0, 1), DataBuffer::In(&mut buf));
        let completion = session.execute(&mut ctx).expect("device answered");
        assert!(!completion.is_success());
        assert_eq!(io.submissions(), 1);
        assert!(session.profile().negative_cache().is_empty());
    }

    #[test]
    fn same_inputs_walk_the_same_dialects() {
        let run = || {
            let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| {
                match request.dialect {
                    Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::Rejected),
                    _ => RawCompletion::failed(RawStatus::SignatureMismatch),
                }
            }));
            let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
            let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
            let err = session.execute(&mut ctx).expect_err("nothing works");
            (io.dialects(), err.to_string())
        };
        assert_eq!(run(), run());
    }

    fn four_ata_dialect_bus() -> BusInfo {
        BusInfo {
            bus_type: BusType::Sata,
            adapter: AdapterCaps {
                ata_passthrough: true,
                scsi_passthrough: true,
                ide_diagnostic: true,
                block_io: true,
                ..AdapterCaps::default()
            },
        }
    }

    fn ranked(profile: &DeviceProfile) -> Vec<Dialect> {
        profile.transports().iter().map(|d| d.dialect).collect()
    }

    #[test]
    fn every_dialect_is_tried_once_in_rank_order() {
        let io = Arc::new(ScriptedIo::new(four_ata_dialect_bus(), |_| {
            RawCompletion::failed(RawStatus::Rejected)
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let order = ranked(session.profile());
        assert_eq!(
            order,
            vec![
                Dialect::AtaPassThrough,
                Dialect::ScsiPassThrough,
                Dialect::IdeDiagnostic,
                Dialect::BlockEmulation
            ]
        );

        let mut ctx = CommandContext::ata(TaskFile::new(crate::ata::opcode::FLUSH_CACHE), DataBuffer::None);
        let err = session.execute(&mut ctx).expect_err("every dialect soft-fails");
        assert_eq!(io.dialects(), order);
        match err {
            DispatchError::NoViableTransport { protocol, attempted } => {
                assert_eq!(protocol, Protocol::Ata);
                assert_eq!(attempted, order);
            }
            other => panic!("expected NoViableTransport, got {other:?}"),
        }
        assert_eq!(session.profile().negative_cache(), order);
    }

    #[test]
    fn demoted_dialect_moves_to_the_back() {
        let everything_fails = Arc::new(AtomicBool::new(false));
        let io = Arc::new(ScriptedIo::new(four_ata_dialect_bus(), {
            let everything_fails = everything_fails.clone();
            move |request| match request.dialect {
                Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
                _ if everything_fails.load(Ordering::SeqCst) => {
                    RawCompletion::failed(RawStatus::Rejected)
                }
                _ => ready(),
            }
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());

        let mut ctx = CommandContext::ata(TaskFile::new(crate::ata::opcode::FLUSH_CACHE), DataBuffer::None);
        session.execute(&mut ctx).expect("second dialect works");
        assert_eq!(
            io.dialects(),
            vec![Dialect::AtaPassThrough, Dialect::ScsiPassThrough]
        );

        io.clear();
        everything_fails.store(true, Ordering::SeqCst);
        let mut ctx = CommandContext::ata(TaskFile::new(crate::ata::opcode::FLUSH_CACHE), DataBuffer::None);
        let err = session.execute(&mut ctx).expect_err("every dialect soft-fails");
        let expected = vec![
            Dialect::ScsiPassThrough,
            Dialect::IdeDiagnostic,
            Dialect::BlockEmulation,
            Dialect::AtaPassThrough,
        ];
        assert_eq!(io.dialects(), expected);
        assert!(matches!(err, DispatchError::NoViableTransport { attempted, .. } if attempted == expected));
    }

    #[test]
    fn negative_cache_only_grows() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => ready(),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut seen = 0;
        for _ in 0..3 {
            let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
            session.execute(&mut ctx).expect("fallback works");
            let cache = session.profile().negative_cache();
            assert!(cache.len() >= seen);
            seen = cache.len();
        }
        assert_eq!(session.profile().negative_cache(), vec![Dialect::AtaPassThrough]);
    }

    #[test]
    fn negative_cache_can_be_disabled() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => ready(),
        }));
        let config = DispatchConfig {
            negative_cache: false,
            ..DispatchConfig::default()
        };
        let session = session(&io, ProtocolFamily::Ata, config);
        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
        session.execute(&mut ctx).expect("fallback works");
        assert!(session.profile().negative_cache().is_empty());
    }

    #[test]
    fn failed_read_leaves_the_caller_buffer_alone() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| {
            if let crate::io::IoData::In(buf) = request.data {
                buf.fill(0xAA);
            }
            match request.dialect {
                Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
                _ => RawCompletion::native(
                    NativeStatus::Scsi {
                        status: scsi::status::CHECK_CONDITION,
                        sense: SenseData::new(scsi::sense::key::MEDIUM_ERROR, 0x11, 0)
                            .to_fixed()
                            .to_vec(),
                    },
                    512,
                ),
            }
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut buf = [0x55u8; 512];
        let mut ctx = CommandContext::ata(TaskFile::read_dma_ext(0, 1), DataBuffer::In(&mut buf));
        let completion = session.execute(&mut ctx).expect("device answered");
        assert!(!completion.is_success());
        assert_eq!(completion.transferred(), 0);
        drop(ctx);
        assert!(buf.iter().all(|b| *b == 0x55));
    }

    #[test]
    fn successful_read_fills_the_caller_buffer() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| {
            if let crate::io::IoData::In(buf) = request.data {
                buf.fill(0xAA);
            }
            RawCompletion::native(NativeStatus::Ata(AtaRegisters::ready()), 512)
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut buf = [0u8; 512];
        let mut ctx = CommandContext::ata(TaskFile::read_dma_ext(0, 1), DataBuffer::In(&mut buf));
        let completion = session.execute(&mut ctx).expect("device answered");
        assert_eq!(completion.transferred(), 512);
        drop(ctx);
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn timeout_is_not_retried_by_default() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |_| {
            RawCompletion::failed(RawStatus::TimedOut)
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
        let completion = session.execute(&mut ctx).expect("timeouts are completions");
        assert_eq!(io.submissions(), 1);
        let ProtocolCompletion::Ata(completion) = completion else {
            panic!("ATA caller gets an ATA completion");
        };
        assert!(!completion.is_success());
        assert!(session.profile().negative_cache().is_empty());
    }

    #[test]
    fn timeout_retry_falls_back_without_demoting() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::TimedOut),
            _ => ready(),
        }));
        let config = DispatchConfig {
            retry_on_timeout: true,
            ..DispatchConfig::default()
        };
        let session = session(&io, ProtocolFamily::Ata, config);
        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
        assert!(session.execute(&mut ctx).expect("fell back").is_success());
        assert_eq!(io.submissions(), 2);
        assert!(session.profile().negative_cache().is_empty());
    }

    /// Advances by a fixed step on every reading.
    struct SteppingClock {
        base: Instant,
        step: Duration,
        ticks: AtomicUsize,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Instant {
            let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) as u32;
            self.base + self.step * ticks
        }
    }

    #[test]
    fn fallbacks_get_the_remaining_budget() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => ready(),
        }));
        let clock = Arc::new(SteppingClock {
            base: Instant::now(),
            step: Duration::from_millis(400),
            ticks: AtomicUsize::new(0),
        });
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default()).with_clock(clock);
        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None)
            .with_timeout(Duration::from_secs(1));
        session.execute(&mut ctx).expect("fallback works");
        let timeouts: Vec<_> = io.log().iter().map(|s| s.timeout).collect();
        assert_eq!(
            timeouts,
            vec![Duration::from_millis(1000), Duration::from_millis(600)]
        );
    }

    #[test]
    fn spent_budget_ends_with_a_timeout_completion() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |_| {
            RawCompletion::failed(RawStatus::NotImplemented)
        }));
        let clock = Arc::new(SteppingClock {
            base: Instant::now(),
            step: Duration::from_secs(2),
            ticks: AtomicUsize::new(0),
        });
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default()).with_clock(clock);
        let mut ctx = CommandContext::scsi(cdb::synchronize_cache_10(), DataBuffer::None)
            .with_timeout(Duration::from_secs(1));
        let completion = session.execute(&mut ctx).expect("timeout completion");
        assert_eq!(io.submissions(), 1);
        let ProtocolCompletion::Scsi(completion) = completion else {
            panic!("SCSI caller gets a SCSI completion");
        };
        let sense = completion.sense_data().expect("sense");
        assert_eq!((sense.key, sense.asc, sense.ascq), (0x0B, 0x3E, 0x02));
    }

    #[test]
    fn translated_invalid_opcode_is_soft() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::Rejected),
            // The bridge doesn't know ATA PASS-THROUGH.
            _ => RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::CHECK_CONDITION,
                    sense: SenseData::new(scsi::sense::key::ILLEGAL_REQUEST, 0x20, 0)
                        .to_fixed()
                        .to_vec(),
                },
                0,
            ),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut ctx = CommandContext::ata(TaskFile::check_power_mode(), DataBuffer::None);
        let err = session.execute(&mut ctx).expect_err("no dialect left");
        assert!(matches!(
            err,
            DispatchError::NoViableTransport { protocol: Protocol::Ata, .. }
        ));
        assert_eq!(
            session.profile().negative_cache(),
            vec![Dialect::AtaPassThrough, Dialect::ScsiPassThrough]
        );
    }

    #[test]
    fn protocol_opacity_across_every_path() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => ready(),
            _ => RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::GOOD,
                    sense: Vec::new(),
                },
                0,
            ),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());

        let mut ctx = CommandContext::scsi(cdb::synchronize_cache_10(), DataBuffer::None);
        let completion = session.execute(&mut ctx).expect("SATL flush");
        assert_eq!(completion.protocol(), Protocol::Scsi);
        assert_eq!(ctx.protocol(), Protocol::Scsi);

        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
        assert_eq!(session.execute(&mut ctx).expect("native").protocol(), Protocol::Ata);
    }

    #[test]
    fn nvme_deallocate_becomes_unmap() {
        let unmap_lists = Arc::new(Mutex::new(Vec::new()));
        let seen = unmap_lists.clone();
        let io = Arc::new(ScriptedIo::new(scsi_only_bus(), move |request| {
            if request.command.first() == Some(&(OpCode::Unmap as u8)) {
                if let crate::io::IoData::Out(bytes) = request.data {
                    seen.lock().push(bytes.to_vec());
                }
            }
            RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::GOOD,
                    sense: Vec::new(),
                },
                0,
            )
        }));
        let session = session(&io, ProtocolFamily::Scsi, DispatchConfig::default());

        let mut ranges = Vec::new();
        ranges.extend_from_slice(&DsmRange::new(0x1000, 8).to_bytes());
        ranges.extend_from_slice(&DsmRange::new(0x8000, 128).to_bytes());
        let mut ctx = CommandContext::nvme(
            NvmeCommand::dataset_management(1, 2, nvme::DSM_DEALLOCATE),
            DataBuffer::Out(&ranges),
        );
        let completion = session.execute(&mut ctx).expect("SNTL deallocate");
        let ProtocolCompletion::Nvme(completion) = completion else {
            panic!("NVMe caller gets an NVMe completion");
        };
        assert!(completion.status.is_success());
        assert_eq!(completion.dword0, 0);

        assert_eq!(io.submissions(), 1);
        let lists = unmap_lists.lock();
        let list = UnmapList::parse(&lists[0]).expect("well-formed parameter list");
        assert_eq!(list.descriptors.len(), 2);
        assert_eq!((list.descriptors[0].lba, list.descriptors[0].blocks), (0x1000, 8));
        assert_eq!((list.descriptors[1].lba, list.descriptors[1].blocks), (0x8000, 128));
    }

    #[test]
    fn deallocate_without_a_rule_never_reaches_the_device() {
        let io = Arc::new(ScriptedIo::new(scsi_only_bus(), |_| RawCompletion::completed(0)));
        let profile = DeviceProfile::new(ProtocolFamily::Scsi, io.bus_info(), false);
        let table = TranslationTable::standard().without("nvme-deallocate-unmap");
        let session = DeviceSession::from_profile(
            io.clone(),
            Handle(1),
            profile,
            Arc::new(table),
            DispatchConfig::default(),
        );
        let ranges = DsmRange::new(0, 8).to_bytes();
        let mut ctx = CommandContext::nvme(
            NvmeCommand::dataset_management(1, 1, nvme::DSM_DEALLOCATE),
            DataBuffer::Out(&ranges),
        );
        let err = session.execute(&mut ctx).expect_err("no rule");
        assert!(matches!(err, DispatchError::NoViableTransport { .. }));
        assert_eq!(io.submissions(), 0);
    }

    #[test]
    fn concurrent_executes_share_one_session() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => ready(),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..16 {
                        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
                        assert!(session.execute(&mut ctx).expect("fallback works").is_success());
                    }
                });
            }
        });
        assert_eq!(session.profile().negative_cache(), vec![Dialect::AtaPassThrough]);
        let fresh = io.dialects().iter().filter(|d| **d == Dialect::AtaPassThrough).count();
        assert!((1..=8).contains(&fresh));
    }

    #[test]
    fn dropping_the_session_closes_the_handle() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |_| ready()));
        drop(session(&io, ProtocolFamily::Ata, DispatchConfig::default()));
        assert_eq!(io.closed(), 1);
    }

    #[test]
    #[traced_test]
    fn soft_failures_are_logged() {
        let io = Arc::new(ScriptedIo::new(ata_and_scsi_bus(), |request| match request.dialect {
            Dialect::AtaPassThrough => RawCompletion::failed(RawStatus::NotImplemented),
            _ => ready(),
        }));
        let session = session(&io, ProtocolFamily::Ata, DispatchConfig::default());
        let mut ctx = CommandContext::ata(TaskFile::flush_cache_ext(), DataBuffer::None);
        session.execute(&mut ctx).expect("fallback works");
        assert!(logs_contain("soft transport failure"));
        assert!(logs_contain("dialect demoted for this device"));
    }
}
