//! Multi-level indirection from stable 64-bit handles to device addresses.
//!
//! Handles are split into 11-bit fields: the bottom field indexes a
//! last-level table of 2048 device addresses, the next field indexes a
//! routing table of child tables. Each table keeps a CPU-side address array
//! and a GPU mirror allocated through the data storage; mirrors are kept in
//! sync through the staging pipeline. The first mutation of a table within a
//! frame stages the full 16 KiB mirror, later mutations patch a single word.
//!
//! `create`, `set` and `root_device_address` dispatch through function
//! pointers which are re-bound each time the table depth grows, so the
//! steady-state calls do not branch on depth.
//!
//! Handle 0 is permanently reserved and always maps to device address 0.

use {
    crate::{
        data::{DataAllocation, UploadCtx},
        driver::DriverError,
    },
    ash::vk,
    log::{trace, warn},
};

/// Entries per table; one 11-bit handle field's worth.
pub const HANDLES_PER_TABLE: usize = 2048;

const LEVEL_SHIFT: u64 = 11;
const LEVEL_MASK: u64 = 0x7ff;
const TABLE_BYTES: vk::DeviceSize = (HANDLES_PER_TABLE * 8) as vk::DeviceSize;

type CreateFn = fn(&mut HandleTable, &mut UploadCtx<'_>) -> Result<u64, DriverError>;
type SetFn = fn(&mut HandleTable, &mut UploadCtx<'_>, u64, u64) -> Result<(), DriverError>;
type RootAddrFn = fn(&HandleTable) -> vk::DeviceAddress;

struct Table {
    addr_list: Box<[u64; HANDLES_PER_TABLE]>,
    allocation: DataAllocation,
    /// Handle registered for the table's own GPU mirror; 0 for the very
    /// first last-level table, whose address is held CPU-side as the root.
    handle: u64,
}

impl Table {
    /// Allocates the GPU mirror and stages a zero fill for it.
    fn create(ctx: &mut UploadCtx<'_>) -> Result<Self, DriverError> {
        let allocation = ctx.alloc(TABLE_BYTES)?;
        let mut staging_data = match ctx.create_staging_data(&allocation) {
            Ok(staging_data) => staging_data,
            Err(err) => {
                ctx.free(allocation);

                return Err(err);
            }
        };

        staging_data.bytes_mut().fill(0);
        ctx.submit(staging_data);

        Ok(Self {
            addr_list: Box::new([0; HANDLES_PER_TABLE]),
            allocation,
            handle: 0,
        })
    }

    /// Writes one entry CPU-side and keeps the GPU mirror in step.
    ///
    /// Staging is write-one-shot per frame: the first mutation stages the
    /// whole table, later mutations patch a single 64-bit word.
    fn set_value(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        index: usize,
        value: u64,
    ) -> Result<(), DriverError> {
        self.addr_list[index] = value;

        let mut staging_data = ctx.create_staging_data(&self.allocation)?;
        let need_init = staging_data.need_init();
        let bytes = staging_data.bytes_mut();

        if need_init {
            for (idx, value) in self.addr_list.iter().enumerate() {
                bytes[idx * 8..idx * 8 + 8].copy_from_slice(&value.to_ne_bytes());
            }
        } else {
            bytes[index * 8..index * 8 + 8].copy_from_slice(&value.to_ne_bytes());
        }

        ctx.submit(staging_data);

        Ok(())
    }

    fn free(self, ctx: &mut UploadCtx<'_>) {
        trace!("freeing table registered under handle {}", self.handle);

        ctx.free(self.allocation);
    }
}

enum Root {
    /// No tables yet; the first `create` builds the level-1 table.
    None,

    /// One last-level table serving handles `1..=2045`.
    Level1(Table),

    /// A routing table over up to 2048 last-level tables.
    Level2 {
        children: Vec<Table>,
        routing: Table,
    },
}

/// Indirection from stable 64-bit handles to device addresses, mirrored on
/// the GPU.
pub struct HandleTable {
    create_handle: CreateFn,
    highest_handle: u64,
    level: u32,
    root: Root,
    root_device_address: RootAddrFn,
    set_handle: SetFn,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Creates an empty table; the first `create` call allocates the first
    /// last-level table.
    pub fn new() -> Self {
        Self {
            create_handle: Self::create_handle0,
            highest_handle: 0,
            level: 0,
            root: Root::None,
            root_device_address: Self::root_device_address0,
            set_handle: Self::set_handle0,
        }
    }

    /// Current table depth: 0 before the first handle, then 1 or 2.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// The highest handle minted so far; handles are never recycled.
    pub fn highest_handle(&self) -> u64 {
        self.highest_handle
    }

    /// Mints the next handle.
    ///
    /// When the current last-level table is within the reserved margin of its
    /// capacity, the tree grows first (allocating a routing table and/or a
    /// new last-level table) and the returned handle lands in the new table.
    pub fn create(&mut self, ctx: &mut UploadCtx<'_>) -> Result<u64, DriverError> {
        (self.create_handle)(self, ctx)
    }

    /// Mints the next handle and points it at `device_address`.
    pub fn create_with(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        device_address: vk::DeviceAddress,
    ) -> Result<u64, DriverError> {
        let handle = self.create(ctx)?;
        self.set(ctx, handle, device_address)?;

        Ok(handle)
    }

    /// Releases a handle.
    ///
    /// Handles are not recycled; the entry simply keeps its last value until
    /// overwritten. Destroying handle 0 is a no-op.
    pub fn destroy(&mut self, handle: u64) {
        let _ = handle;
    }

    /// Points `handle` at `device_address`, updating the CPU-side array and
    /// staging the GPU mirror update for the next upload.
    pub fn set(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        handle: u64,
        device_address: vk::DeviceAddress,
    ) -> Result<(), DriverError> {
        debug_assert_ne!(handle, 0, "handle 0 is reserved for the null object");

        (self.set_handle)(self, ctx, handle, device_address)
    }

    /// Resolves a handle against the CPU-side arrays.
    ///
    /// Handle 0 always resolves to device address 0.
    pub fn lookup(&self, handle: u64) -> vk::DeviceAddress {
        match &self.root {
            Root::None => 0,
            Root::Level1(table) => table.addr_list[(handle & LEVEL_MASK) as usize],
            Root::Level2 { children, .. } => {
                let child = (handle >> LEVEL_SHIFT) as usize;

                children
                    .get(child)
                    .map(|table| table.addr_list[(handle & LEVEL_MASK) as usize])
                    .unwrap_or(0)
            }
        }
    }

    /// Device address of the root table's GPU mirror; shaders start handle
    /// resolution here.
    pub fn root_device_address(&self) -> vk::DeviceAddress {
        (self.root_device_address)(self)
    }

    /// Frees every table's GPU mirror and resets to depth 0.
    pub fn destroy_all(&mut self, ctx: &mut UploadCtx<'_>) {
        match std::mem::replace(&mut self.root, Root::None) {
            Root::None => (),
            Root::Level1(table) => table.free(ctx),
            Root::Level2 { children, routing } => {
                for table in children {
                    table.free(ctx);
                }

                routing.free(ctx);
            }
        }

        self.create_handle = Self::create_handle0;
        self.set_handle = Self::set_handle0;
        self.root_device_address = Self::root_device_address0;
        self.level = 0;
        self.highest_handle = 0;
    }

    fn create_handle0(&mut self, ctx: &mut UploadCtx<'_>) -> Result<u64, DriverError> {
        trace!("growing handle table to one level");

        let table = Table::create(ctx)?;

        self.root = Root::Level1(table);
        self.level = 1;
        self.create_handle = Self::create_handle1;
        self.set_handle = Self::set_handle1;
        self.root_device_address = Self::root_device_address1;

        self.highest_handle = 1;
        Ok(self.highest_handle)
    }

    fn create_handle1(&mut self, ctx: &mut UploadCtx<'_>) -> Result<u64, DriverError> {
        // Hand out handles from the last-level table unless it is almost
        // full; the last three slots are reserved so the routing table and
        // the next last-level table can register themselves during growth
        if self.highest_handle != LEVEL_MASK - 2 {
            self.highest_handle += 1;
            return Ok(self.highest_handle);
        }

        trace!("growing handle table to two levels");

        let mut routing = Table::create(ctx)?;
        let table = match Table::create(ctx) {
            Ok(table) => table,
            Err(err) => {
                routing.free(ctx);

                return Err(err);
            }
        };

        let Root::Level1(first) = &self.root else {
            unreachable!();
        };
        let first_address = first.allocation.device_address();

        if let Err(err) = routing
            .set_value(ctx, 0, first_address)
            .and_then(|_| routing.set_value(ctx, 1, table.allocation.device_address()))
        {
            table.free(ctx);
            routing.free(ctx);

            return Err(err);
        }

        let Root::Level1(first) = std::mem::replace(&mut self.root, Root::None) else {
            unreachable!();
        };

        let routing_handle = self.highest_handle + 1;
        let table_handle = self.highest_handle + 2;
        let routing_address = routing.allocation.device_address();
        let table_address = table.allocation.device_address();

        self.root = Root::Level2 {
            children: vec![first, table],
            routing,
        };
        self.level = 2;
        self.create_handle = Self::create_handle2;
        self.set_handle = Self::set_handle2;
        self.root_device_address = Self::root_device_address2;

        // Register the new tables under their reserved handles
        self.set(ctx, routing_handle, routing_address)?;
        self.set(ctx, table_handle, table_address)?;
        if let Root::Level2 { children, routing } = &mut self.root {
            routing.handle = routing_handle;
            children[1].handle = table_handle;
        }

        self.highest_handle = table_handle + 1;
        Ok(self.highest_handle)
    }

    fn create_handle2(&mut self, ctx: &mut UploadCtx<'_>) -> Result<u64, DriverError> {
        // Reserve the tail of each last-level table so the next one can
        // register itself before handles spill over
        if self.highest_handle & LEVEL_MASK != LEVEL_MASK - 3 {
            self.highest_handle += 1;
            return Ok(self.highest_handle);
        }

        let index = (self.highest_handle >> LEVEL_SHIFT) as usize + 1;
        if index >= HANDLES_PER_TABLE {
            warn!("handle table is full");

            return Err(DriverError::OutOfMemory);
        }

        trace!("appending last-level handle table {index}");

        let table = Table::create(ctx)?;
        let table_handle = self.highest_handle + 1;
        let table_address = table.allocation.device_address();

        let Root::Level2 { children, routing } = &mut self.root else {
            unreachable!();
        };

        debug_assert_eq!(children.len(), index);

        routing.set_value(ctx, index, table_address)?;
        children.push(table);

        self.set(ctx, table_handle, table_address)?;
        if let Root::Level2 { children, .. } = &mut self.root {
            children[index].handle = table_handle;
        }

        self.highest_handle = table_handle + 1;
        Ok(self.highest_handle)
    }

    fn set_handle0(&mut self, _: &mut UploadCtx<'_>, _: u64, _: u64) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_handle1(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        handle: u64,
        device_address: u64,
    ) -> Result<(), DriverError> {
        debug_assert!(handle < HANDLES_PER_TABLE as u64);

        let Root::Level1(table) = &mut self.root else {
            unreachable!();
        };

        table.set_value(ctx, handle as usize, device_address)
    }

    fn set_handle2(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        handle: u64,
        device_address: u64,
    ) -> Result<(), DriverError> {
        let Root::Level2 { children, .. } = &mut self.root else {
            unreachable!();
        };

        let child = (handle >> LEVEL_SHIFT) as usize;
        debug_assert!(child < children.len());

        children[child].set_value(ctx, (handle & LEVEL_MASK) as usize, device_address)
    }

    fn root_device_address0(&self) -> vk::DeviceAddress {
        0
    }

    fn root_device_address1(&self) -> vk::DeviceAddress {
        let Root::Level1(table) = &self.root else {
            unreachable!();
        };

        table.allocation.device_address()
    }

    fn root_device_address2(&self) -> vk::DeviceAddress {
        let Root::Level2 { routing, .. } = &self.root else {
            unreachable!();
        };

        routing.allocation.device_address()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{data::DataStorage, data::tests::test_ctx, staging::StagingManager},
    };

    #[test]
    pub fn null_handle_resolves_to_zero() {
        let table = HandleTable::new();

        assert_eq!(table.lookup(0), 0);
        assert_eq!(table.root_device_address(), 0);
        assert_eq!(table.level(), 0);
    }

    #[test]
    pub fn create_set_lookup_round_trip() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);
        let mut table = HandleTable::new();

        let handle = table.create(&mut ctx).unwrap();
        assert_eq!(handle, 1);
        assert_eq!(table.level(), 1);
        assert_ne!(table.root_device_address(), 0);

        table.set(&mut ctx, handle, 0xdead_0000).unwrap();
        assert_eq!(table.lookup(handle), 0xdead_0000);
        assert_eq!(table.lookup(0), 0);

        table.set(&mut ctx, handle, 0xbeef_0000).unwrap();
        assert_eq!(table.lookup(handle), 0xbeef_0000);

        table.destroy_all(&mut ctx);
        assert!(data.is_empty());
    }

    #[test]
    pub fn grows_from_one_to_two_levels() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);
        let mut table = HandleTable::new();

        // 2048 minus the reserved margin of 3 handles fit in one level
        for expected in 1..=2045 {
            let handle = table.create(&mut ctx).unwrap();

            assert_eq!(handle, expected);
            assert_eq!(table.level(), 1);
        }

        let level1_root = table.root_device_address();

        // One more create triggers the growth to a routing table; the new
        // handle lands in the second last-level table
        let handle = table.create(&mut ctx).unwrap();
        assert_eq!(handle, 2048);
        assert_eq!(handle >> 11, 1);
        assert_eq!(table.level(), 2);
        assert_ne!(table.root_device_address(), level1_root);

        // The routing and last-level tables occupied the margin handles
        assert_ne!(table.lookup(2046), 0);
        assert_ne!(table.lookup(2047), 0);
        assert_eq!(table.lookup(2046), table.root_device_address());

        // Entries survive the growth
        table.set(&mut ctx, 42, 0x4200).unwrap();
        assert_eq!(table.lookup(42), 0x4200);

        table.set(&mut ctx, handle, 0x2048_0000).unwrap();
        assert_eq!(table.lookup(handle), 0x2048_0000);
    }

    #[test]
    pub fn two_level_table_appends_tables() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);
        let mut table = HandleTable::new();

        let mut last = 0;
        while last < 5000 {
            last = table.create(&mut ctx).unwrap();
        }

        assert_eq!(table.level(), 2);

        table.set(&mut ctx, last, 0xabcd_0000).unwrap();
        assert_eq!(table.lookup(last), 0xabcd_0000);

        // Older handles still route through the first table
        table.set(&mut ctx, 7, 0x7000).unwrap();
        assert_eq!(table.lookup(7), 0x7000);
    }

    #[test]
    pub fn mirror_patch_after_upload_cycle() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut table = HandleTable::new();

        {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            let handle = table.create(&mut ctx).unwrap();
            table.set(&mut ctx, handle, 0x1000).unwrap();
        }

        let record = staging.drain_for_test();
        staging.upload_done(crate::data::tests::TEST_TIERS, &record, &mut data);

        // Next frame: the first mutation stages the full table again
        let mut ctx = test_ctx(&mut data, &mut staging, 1);
        table.set(&mut ctx, 1, 0x2000).unwrap();
        assert_eq!(table.lookup(1), 0x2000);
    }
}
