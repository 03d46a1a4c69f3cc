//! The driver facade: every operation callers see.
//!
//! One `Driver` owns one connection epoch: the socket, the shared transfer
//! region, the device address space, and the in-flight command table. The
//! conversation is strictly synchronous: each operation stages its payload,
//! sends one 16-byte header, then blocks until the matching completion has
//! been read and post-processed.

use tracing::{debug, error, info, warn};

use lumen_core::config::KernelConfig;
use lumen_core::{
    CommandMeta, CopyMeta, DeviceAddress, DeviceAddressSpace, DriverConfig, InFlightCommandTable,
    KernelMeta,
};
use lumen_protocol::launch::{
    self, AbiHeader, Dim3, LaunchLayout, PlacementPolicy, ABI_HEADER_LEN,
    DEFAULT_REGS_PER_THREAD, DEFAULT_SMEM_PER_BLOCK,
};
use lumen_protocol::wire::{CommandHeader, CopyDirection, ErrorCode, ResponseHeader};
use lumen_protocol::LaunchFlags;
use lumen_transport::ChannelConnection;

use crate::error::DriverError;
use crate::kernel::KernelImage;

/// The resolved outcome of one command.
///
/// For kernel commands `program_counter` has already been translated back to
/// an offset inside the original compiled image (0 when the device reported
/// a PC outside the kernel's code region). An EXECUTION error here is a
/// device-side fault, not a driver failure; it is a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub command_id: u8,
    pub error: ErrorCode,
    pub program_counter: u32,
}

pub struct Driver {
    conn: ChannelConnection,
    dram: DeviceAddressSpace,
    inflight: InFlightCommandTable,
    placement: PlacementPolicy,
    kernel_cfg: KernelConfig,
    last_completion: Option<Completion>,
}

impl Driver {
    /// Establish a connection epoch: socket, shared region, fd handshake.
    /// Any failure tears everything down; there is no partial state.
    pub fn connect(config: &DriverConfig) -> Result<Self, DriverError> {
        let conn =
            ChannelConnection::connect(&config.server.socket_path, config.transfer.region_bytes)?;
        let placement = match config.kernel.fixed_load_addr {
            Some(addr) => PlacementPolicy::FixedAddress(addr),
            None => PlacementPolicy::Aligned,
        };
        info!(
            dram_base = format_args!("{:#x}", config.device.dram_base),
            dram_size = config.device.dram_size,
            ?placement,
            "driver ready"
        );
        Ok(Driver {
            conn,
            dram: DeviceAddressSpace::new(config.device.dram_base, config.device.dram_size),
            inflight: InFlightCommandTable::new(),
            placement,
            kernel_cfg: config.kernel.clone(),
            last_completion: None,
        })
    }

    /// Reserve device memory. Arena semantics: the allocation lives until
    /// the connection is torn down.
    pub fn alloc(&mut self, bytes: u64) -> Result<DeviceAddress, DriverError> {
        Ok(self.dram.allocate(bytes)?)
    }

    /// Launch a kernel and block until the device acknowledges it.
    ///
    /// Builds the ABI blob (header, params, padding, code), places it and the
    /// per-launch stack and TLS regions in device memory, stages the blob in
    /// the shared region, and submits a KERNEL command. Dimension and layout
    /// validation happen before anything is allocated, so a rejected launch
    /// has no side effects.
    pub fn launch(
        &mut self,
        image: &KernelImage,
        grid: Dim3,
        block: Dim3,
        params: &[u8],
    ) -> Result<Completion, DriverError> {
        grid.validate()?;
        block.validate()?;
        image.validate()?;
        let image_size =
            u32::try_from(image.bytes.len()).map_err(|_| DriverError::InvalidKernelImage {
                name: image.name.clone(),
                reason: "image exceeds the 32-bit device address space",
            })?;

        let code = image.loadable();
        let layout =
            LaunchLayout::compute(params.len(), code.len(), self.dram.cursor().0, self.placement)?;

        let blob_addr = self.dram.allocate(layout.total_len as u64)?;
        let stack = self.dram.allocate(self.kernel_cfg.stack_bytes as u64)?;
        let tls = self.dram.allocate(self.kernel_cfg.tls_bytes as u64)?;
        // the stack grows downward; its base points at the top word
        let stack_base = stack.0 + self.kernel_cfg.stack_bytes.saturating_sub(4);
        let code_base = blob_addr.0 + layout.code_offset;

        let abi = AbiHeader {
            start_pc: code_base + (image.start_pc - image.load_offset),
            entry_pc: code_base + (image.entry_pc - image.load_offset),
            params_size: params.len() as u32 + layout.params_pad,
            image_size,
            stack_base,
            tls_base: tls.0,
            params_base: blob_addr.0 + ABI_HEADER_LEN as u32,
            grid,
            block,
            printf_host_addr: 0,
            regs_per_thread: DEFAULT_REGS_PER_THREAD,
            smem_per_block: DEFAULT_SMEM_PER_BLOCK,
            flags: LaunchFlags::empty(),
        };
        let blob = launch::build_blob(&abi, params, code, &layout);

        self.conn.ensure_region(blob.len())?;
        self.conn.region_mut().write_at(0, &blob)?;

        let command_id = self.inflight.register(CommandMeta::Kernel(KernelMeta {
            code_base: DeviceAddress(code_base),
            load_offset: image.load_offset,
        }))?;
        let header = CommandHeader::Kernel {
            command_id,
            payload_offset: 0,
            payload_len: layout.total_len,
            device_base: blob_addr.0,
        };
        debug!(
            kernel = %image.name,
            command_id,
            blob_addr = %blob_addr,
            code_base = format_args!("{code_base:#x}"),
            blob_len = layout.total_len,
            "submitting kernel launch"
        );
        self.send_and_wait(command_id, &header).map(|(c, _)| c)
    }

    /// Copy host bytes into device memory. The payload is staged in the
    /// shared region before the header is sent; by the time the completion
    /// arrives the device has pulled it.
    pub fn memcpy_h2d(&mut self, dst: DeviceAddress, src: &[u8]) -> Result<Completion, DriverError> {
        let len = u32::try_from(src.len()).map_err(|_| DriverError::CopyTooLarge(src.len()))?;
        self.conn.ensure_region(src.len())?;
        self.conn.region_mut().write_at(0, src)?;

        let command_id = self.inflight.register(CommandMeta::Copy(CopyMeta {
            device_addr: dst,
            region_offset: 0,
            len,
            direction: CopyDirection::HostToDevice,
        }))?;
        let header = CommandHeader::Copy {
            command_id,
            src: 0,
            dst: dst.0,
            len,
            direction: CopyDirection::HostToDevice,
        };
        debug!(command_id, dst = %dst, len, "submitting H2D copy");
        self.send_and_wait(command_id, &header).map(|(c, _)| c)
    }

    /// Copy device memory into `dst`. No payload is staged; the header only
    /// requests the copy, and `dst` is written exclusively from the shared
    /// region after a completion with error NONE has been consumed; the
    /// bytes are not guaranteed valid on the host before that.
    pub fn memcpy_d2h(
        &mut self,
        dst: &mut [u8],
        src: DeviceAddress,
    ) -> Result<Completion, DriverError> {
        let len = u32::try_from(dst.len()).map_err(|_| DriverError::CopyTooLarge(dst.len()))?;
        self.conn.ensure_region(dst.len())?;

        let command_id = self.inflight.register(CommandMeta::Copy(CopyMeta {
            device_addr: src,
            region_offset: 0,
            len,
            direction: CopyDirection::DeviceToHost,
        }))?;
        let header = CommandHeader::Copy {
            command_id,
            src: src.0,
            dst: 0,
            len,
            direction: CopyDirection::DeviceToHost,
        };
        debug!(command_id, src = %src, len, "submitting D2H copy");
        let (completion, meta) = self.send_and_wait(command_id, &header)?;

        if completion.error == ErrorCode::None {
            if let CommandMeta::Copy(copy) = meta {
                self.conn
                    .region()
                    .read_into(copy.region_offset as usize, dst)?;
            }
        }
        Ok(completion)
    }

    /// The most recently consumed completion, if any.
    pub fn last_completion(&self) -> Option<&Completion> {
        self.last_completion.as_ref()
    }

    pub fn outstanding_commands(&self) -> usize {
        self.inflight.outstanding()
    }

    /// Send one header, then read responses until ours arrives. Responses
    /// referencing unknown command ids are protocol errors: logged and
    /// discarded without touching any outstanding command.
    fn send_and_wait(
        &mut self,
        command_id: u8,
        header: &CommandHeader,
    ) -> Result<(Completion, CommandMeta), DriverError> {
        if let Err(e) = self.conn.send_header(&header.encode()) {
            return Err(self.connection_lost(e));
        }

        loop {
            let raw = match self.conn.recv_response() {
                Ok(raw) => raw,
                Err(e) => return Err(self.connection_lost(e)),
            };
            let response = match ResponseHeader::decode(&raw) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "discarding malformed response");
                    continue;
                }
            };
            let Some(meta) = self.inflight.resolve(response.command_id) else {
                warn!(
                    command_id = response.command_id,
                    "response references unknown command id; discarding"
                );
                continue;
            };

            let program_counter = match &meta {
                CommandMeta::Kernel(kernel) => {
                    kernel.translate_pc(response.program_counter).unwrap_or(0)
                }
                CommandMeta::Copy(_) => response.program_counter,
            };
            let completion = Completion {
                command_id: response.command_id,
                error: response.error,
                program_counter,
            };
            if completion.error == ErrorCode::Execution {
                debug!(
                    command_id = completion.command_id,
                    pc = format_args!("{program_counter:#x}"),
                    "device reported execution error"
                );
            }
            self.last_completion = Some(completion);

            if completion.command_id == command_id {
                return Ok((completion, meta));
            }
            // a completion for an earlier command: resolved above, keep reading
        }
    }

    /// The connection is gone; every outstanding command's outcome is now
    /// permanently unknown. Surfaced, never silently dropped.
    fn connection_lost(&mut self, source: lumen_transport::TransportError) -> DriverError {
        let command_ids = self.inflight.drain_unresolved();
        error!(
            ?command_ids,
            error = %source,
            "connection lost with commands outstanding"
        );
        DriverError::OutcomeUnknown {
            command_ids,
            source,
        }
    }
}
