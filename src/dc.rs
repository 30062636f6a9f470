//! Distributed clocks: offset and drift compensation arithmetic and
//! topology delay propagation.

use crate::{
    error::Error,
    fmt,
    slave::{Slave, Topology},
};

/// Offsets are only rewritten when they drift further than this from the
/// master application time.
pub(crate) const SYSTEM_TIME_TOLERANCE_NS: u64 = 1_000;

/// Compute a new system time offset for a slave with a 32 bit DC clock.
///
/// All arithmetic wraps at 32 bits; the upper half of the returned offset
/// is zeroed.
pub(crate) fn offset32(system_time: u64, old_offset: u64, app_time_sent: u64) -> u64 {
    let system_time32 = system_time as u32;
    let old_offset32 = old_offset as u32;

    let time_diff = (app_time_sent as u32).wrapping_sub(system_time32) as i32;

    if time_diff.unsigned_abs() > SYSTEM_TIME_TOLERANCE_NS as u32 {
        u64::from((time_diff as u32).wrapping_add(old_offset32))
    } else {
        old_offset
    }
}

/// Compute a new system time offset for a slave with a 64 bit DC clock.
pub(crate) fn offset64(system_time: u64, old_offset: u64, app_time_sent: u64) -> u64 {
    let time_diff = app_time_sent.wrapping_sub(system_time) as i64;

    if time_diff.unsigned_abs() > SYSTEM_TIME_TOLERANCE_NS {
        old_offset.wrapping_add(time_diff as u64)
    } else {
        old_offset
    }
}

/// The SYNC1 cycle register value.
///
/// The shift wraps through modulo `sync0_cycle` and the pair silently
/// saturates to zero on underflow, mirroring the behaviour running drives
/// already depend on.
pub(crate) fn sync1_cycle_register(sync0_cycle: u32, sync1_cycle: u32, sync1_shift: i32) -> u32 {
    if sync0_cycle == 0 {
        return sync1_cycle;
    }

    let shift = i64::from(sync1_shift) % i64::from(sync0_cycle);
    let value = i64::from(sync1_cycle) + shift;

    if value < 0 {
        0
    } else {
        value as u32
    }
}

/// First SYNC0 pulse time: the next-but-one cycle boundary after
/// `app_time`, shifted by `sync0_shift`.
pub(crate) fn sync_start_time(app_time: u64, sync0_cycle: u32, sync0_shift: i32) -> u64 {
    let cycle = u64::from(sync0_cycle);

    if cycle == 0 {
        return app_time;
    }

    let boundary = (app_time / cycle + 2) * cycle;

    if sync0_shift.is_negative() {
        boundary.saturating_sub(u64::from(sync0_shift.unsigned_abs()))
    } else {
        boundary + u64::from(sync0_shift.unsigned_abs())
    }
}

/// Find the upstream slave of `slave` among the slaves before it in ring
/// order.
///
/// When the previous slave is a line end, the true parent is the most
/// recent junction: traffic returns to the fork before continuing to this
/// slave.
fn find_parent(parents: &[Slave], slave: &Slave) -> Result<Option<u16>, Error> {
    let mut parents_it = parents.iter().rev();

    let Some(parent) = parents_it.next() else {
        // First on the network
        return Ok(None);
    };

    if parent.ports.topology() == Topology::LineEnd {
        let split_point = parents_it
            .find(|candidate| candidate.ports.topology().is_junction())
            .ok_or_else(|| {
                fmt::error!("no fork parent found for slave {}", slave.index);

                Error::Topology
            })?;

        Ok(Some(split_point.index))
    } else {
        Ok(Some(parent.index))
    }
}

/// Walk the discovered ring, assigning parents and downstream ports.
pub(crate) fn assign_parents(slaves: &mut [Slave]) -> Result<(), Error> {
    for index in 0..slaves.len() {
        let (parents, rest) = slaves.split_at_mut(index);
        let slave = &mut rest[0];

        slave.parent_index = find_parent(parents, slave)?;

        if let Some(parent_index) = slave.parent_index {
            let child_index = slave.index;
            let entry_port = parents[usize::from(parent_index)].ports.entry_port();

            let parent = &mut parents[usize::from(parent_index)];

            if parent
                .ports
                .assign_next_downstream(&entry_port, child_index)
                .is_none()
            {
                fmt::error!(
                    "parent {} has no free port for slave {}",
                    parent_index,
                    child_index
                );

                return Err(Error::Topology);
            }
        }
    }

    Ok(())
}

/// Compute each slave's cumulative transmission delay from the reference
/// clock using the port receive times latched by the delay measurement
/// broadcast.
pub(crate) fn configure_delays(slaves: &mut [Slave]) {
    for index in 0..slaves.len() {
        let (parents, rest) = slaves.split_at_mut(index);
        let slave = &mut rest[0];

        let Some(parent) = slave
            .parent_index
            .and_then(|parent| parents.get(usize::from(parent)))
        else {
            slave.transmission_delay = 0;

            continue;
        };

        let parent_prop_time = parent.ports.total_propagation_time().unwrap_or(0);
        let this_prop_time = slave.ports.total_propagation_time().unwrap_or(0);

        let link_delay = match parent.ports.topology() {
            Topology::Passthrough | Topology::LineEnd => {
                parent_prop_time.saturating_sub(this_prop_time) / 2
            }
            Topology::Fork | Topology::Cross => {
                let children_loop_time = parent
                    .ports
                    .port_assigned_to(slave.index)
                    .and_then(|port| parent.ports.propagation_time_to(port))
                    .unwrap_or(parent_prop_time);

                children_loop_time.saturating_sub(this_prop_time) / 2
            }
        };

        slave.transmission_delay = parent.transmission_delay + link_delay;

        fmt::debug!(
            "slave {}: transmission delay {} ns",
            slave.index,
            slave.transmission_delay
        );
    }
}

/// Pick the reference clock: the application's choice when valid, else
/// the first slave that advertises DC support.
pub(crate) fn select_reference(slaves: &[Slave], preferred: Option<usize>) -> Option<usize> {
    if let Some(index) = preferred {
        if slaves
            .get(index)
            .map(|slave| slave.flags.dc_supported)
            .unwrap_or(false)
        {
            return Some(index);
        }

        fmt::warning!("preferred DC reference is not DC capable, falling back");
    }

    slaves.iter().position(|slave| slave.flags.dc_supported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DeviceIndex;

    #[test]
    fn offset32_applies_large_diff() {
        // Slave clock at 0x100, app time 0x1000: the slave is 0xf00 ns
        // behind
        let new = offset32(0x0000_0100, 0, 0x0000_1000);

        assert_eq!(new, 0xf00);

        // A second pass with the offset applied yields no change
        let again = offset32(0x0000_1000, new, 0x0000_1000);

        assert_eq!(again, new);
    }

    #[test]
    fn offset32_within_tolerance_is_kept() {
        assert_eq!(offset32(1000, 42, 1500), 42);
    }

    #[test]
    fn offset64_wraps() {
        let new = offset64(u64::MAX, 0, 10_000);

        assert_eq!(new, 10_001);
    }

    #[test]
    fn sync1_underflow_zeroes() {
        assert_eq!(sync1_cycle_register(1_000_000, 500_000, -2_600_000), 0);
        assert_eq!(
            sync1_cycle_register(1_000_000, 500_000, -300_000),
            200_000
        );
        // Shift wraps through modulo sync0
        assert_eq!(
            sync1_cycle_register(1_000_000, 500_000, 2_300_000),
            800_000
        );
    }

    #[test]
    fn start_time_on_cycle_boundary() {
        let start = sync_start_time(10_500_000, 1_000_000, 0);

        assert_eq!(start, 12_000_000);
        assert_eq!(start % 1_000_000, 0);

        assert_eq!(sync_start_time(10_500_000, 1_000_000, -250_000), 11_750_000);
    }

    fn line_slave(index: u16, times: [u32; 4], active: [bool; 4]) -> Slave {
        let mut slave = Slave::new(index, DeviceIndex::Main);

        slave.ports = crate::slave::Ports::new(active);
        slave.ports.set_receive_times(times);

        slave
    }

    #[test]
    fn line_topology_delays() {
        // Three slaves in a line. The first sees a long round trip, each
        // successive one a shorter one.
        let mut slaves = vec![
            line_slave(0, [0, 1500, 0, 0], [true, true, false, false]),
            line_slave(1, [0, 1000, 0, 0], [true, true, false, false]),
            line_slave(2, [0, 0, 0, 0], [true, false, false, false]),
        ];

        assign_parents(&mut slaves).unwrap();
        configure_delays(&mut slaves);

        assert_eq!(slaves[0].parent_index, None);
        assert_eq!(slaves[1].parent_index, Some(0));
        assert_eq!(slaves[2].parent_index, Some(1));

        assert_eq!(slaves[0].transmission_delay, 0);
        // (1500 - 1000) / 2
        assert_eq!(slaves[1].transmission_delay, 250);
        // 250 + (1000 - 0) / 2
        assert_eq!(slaves[2].transmission_delay, 750);
    }

    #[test]
    fn reference_selection_prefers_application_choice() {
        let mut slaves = vec![
            line_slave(0, [0; 4], [true, false, false, false]),
            line_slave(1, [0; 4], [true, false, false, false]),
        ];

        slaves[0].flags.dc_supported = true;
        slaves[1].flags.dc_supported = true;

        assert_eq!(select_reference(&slaves, Some(1)), Some(1));
        assert_eq!(select_reference(&slaves, None), Some(0));

        slaves[1].flags.dc_supported = false;

        assert_eq!(select_reference(&slaves, Some(1)), Some(0));
    }
}
