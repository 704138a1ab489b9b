#[allow(dead_code)]
pub const DRIVER_NAME: &str = "EtherLink";

/// Packet Driver Specification version implemented by the API multiplexer.
pub const PKTDRV_SPEC_VERSION: u16 = 0x010b;

/// Driver-internal version reported by `driver_info`.
pub const DRIVER_VERSION: u16 = 0x0301;

/// Size of the private interrupt stack.
pub const ISR_STACK_SIZE: usize = 0x800;

/// Depth of the TX and RX descriptor rings of the bus-master variants.
/// Must be a power of two.
pub const RING_DEPTH: usize = 16;

/// Number of packet buffers reserved per NIC at init.
pub const BUFFERS_PER_NIC: usize = 32;

/// Number of bounce buffers reserved for the DMA safety layer.
pub const BOUNCE_BUFFERS: usize = 8;

/// Maximum number of controllers the resident core multiplexes.
pub const MAX_NICS: usize = 4;

/// Capacity of the packet driver handle table.
pub const MAX_HANDLES: usize = 16;

/// Longest type-filter template accepted by `access_type`.
pub const MAX_TYPE_LEN: usize = 8;

/// Multicast addresses stored per NIC.
pub const MAX_MULTICAST: usize = 8;

/// Largest frame accepted on the send path (1500 MTU + header, no FCS).
pub const ETH_FRAME_MAX: usize = 1514;

/// Smallest frame the hardware will put on the wire without padding.
#[allow(dead_code)]
pub const ETH_FRAME_MIN: usize = 60;

/// Software interrupt vectors reserved by the Packet Driver Specification.
pub const PKTDRV_VECTOR_FIRST: u8 = 0x60;
pub const PKTDRV_VECTOR_LAST: u8 = 0x7f;
