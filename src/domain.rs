//! Process data domains: FMMU layout, datagram pair construction and
//! cyclic working counter accounting with redundancy reconciliation.

use crate::{
    config::{SlaveConfig, SmDirection},
    datagram::{Datagram, DatagramState, DeviceIndex, ImageRef, MAX_PDU_DATA},
    error::{ConfigError, Error},
    fmt,
    pdu_loop::{DatagramHandle, PduQueue},
};
use smallvec::SmallVec;

/// Aggregate working counter interpretation for a whole domain.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WcState {
    /// No slave exchanged any data.
    #[default]
    Zero,
    /// Some but not all expected exchanges happened.
    Incomplete,
    /// All registered process data was exchanged.
    Complete,
}

/// Application visible domain state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DomainState {
    /// Sum of all working counters over all domain datagrams and devices.
    pub working_counter: u16,
    /// Working counter interpretation.
    pub wc_state: WcState,
    /// Whether any process data travelled over the backup device in the
    /// last cycle.
    pub redundancy_active: bool,
}

/// An FMMU window placed in a domain.
#[derive(Debug, Clone)]
pub(crate) struct DomainFmmu {
    /// Owning slave config index.
    pub config: usize,
    pub direction: SmDirection,
    /// Byte offset within the domain image.
    pub logical_offset: usize,
    /// Window size in bytes.
    pub data_size: usize,
}

/// A main datagram plus its optional backup-device clone, covering one
/// logical address chunk of at most [`MAX_PDU_DATA`] bytes.
#[derive(Debug)]
pub(crate) struct DatagramPair {
    /// Datagram handle per device.
    datagrams: [Option<DatagramHandle>; 2],
    /// Byte offset of the chunk within the domain image.
    offset: usize,
    /// Chunk size in bytes.
    size: usize,
    /// Expected working counter for this chunk.
    expected_wkc: u16,
    /// Copy of the bytes last sent, kept for redundancy comparison.
    /// Empty without a backup device.
    send_buffer: Vec<u8>,
}

/// Named container of FMMU configs owning a contiguous process image.
#[derive(Debug, Default)]
pub struct Domain {
    pub(crate) index: usize,
    logical_base_address: u32,
    image: Vec<u8>,
    /// Per-direction placement cursors, indexed by
    /// [`SmDirection::index`].
    offset_used: [usize; 2],
    /// The config the most recent FMMU was placed for.
    last_config: Option<usize>,
    pub(crate) fmmu_configs: Vec<DomainFmmu>,
    pairs: Vec<DatagramPair>,
    expected_wkc: u16,
    working_counter: [u16; 2],
    wc_changes: u32,
    redundancy_active: bool,
}

impl Domain {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Current domain image size in bytes: the larger of the two
    /// direction extents (they coincide with the sum when no PDOs
    /// overlap, as every non-overlapping placement re-bases both
    /// cursors).
    pub fn size(&self) -> usize {
        self.offset_used[0].max(self.offset_used[1])
    }

    /// The domain's logical base address, valid after activation.
    pub fn logical_base_address(&self) -> u32 {
        self.logical_base_address
    }

    /// Expected working counter over all pairs.
    pub fn expected_working_counter(&self) -> u16 {
        self.expected_wkc
    }

    /// The process image. Registered PDO entries live at the offsets
    /// returned during registration.
    pub fn data(&self) -> &[u8] {
        &self.image
    }

    /// The process image, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub(crate) fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    /// Place an FMMU window of `data_size` bytes for `config`.
    ///
    /// Returns the logical byte offset of the window within the domain.
    /// Consecutive placements for the same config share logical bytes
    /// when `allow_overlapping` is set; otherwise both direction cursors
    /// are re-based past all previous placements.
    pub(crate) fn add_fmmu(
        &mut self,
        config: usize,
        sync_index: u8,
        direction: SmDirection,
        data_size: usize,
        allow_overlapping: bool,
    ) -> Result<usize, ConfigError> {
        let logical_offset = if allow_overlapping && self.last_config == Some(config) {
            self.offset_used[direction.index()]
        } else {
            let offset = self.offset_used[0].max(self.offset_used[1]);

            self.offset_used = [offset, offset];

            offset
        };

        self.last_config = Some(config);

        self.offset_used[direction.index()] = logical_offset
            .checked_add(data_size)
            .ok_or(ConfigError::OffsetOverflow)?;

        self.fmmu_configs.push(DomainFmmu {
            config,
            direction,
            logical_offset,
            data_size,
        });

        fmt::debug!(
            "domain {}: added {} bytes at {} (SM{})",
            self.index,
            data_size,
            logical_offset,
            sync_index
        );

        Ok(logical_offset)
    }

    /// Finalise the domain at activation: freeze the logical base
    /// address, allocate the image and partition the FMMU windows into
    /// datagram pairs of at most [`MAX_PDU_DATA`] bytes, never splitting
    /// a window.
    pub(crate) fn finish(
        &mut self,
        base_address: u32,
        configs: &[SlaveConfig],
        queue: &mut PduQueue,
        redundant: bool,
    ) -> Result<(), Error> {
        self.logical_base_address = base_address;
        self.image = vec![0; self.size()];
        self.expected_wkc = 0;

        let mut datagram_offset = 0usize;
        let mut candidate_start = 0usize;
        let mut valid_start = 0usize;

        for fmmu in &self.fmmu_configs {
            if fmmu.data_size > MAX_PDU_DATA {
                fmt::error!(
                    "FMMU of {} bytes exceeds maximum datagram size",
                    fmmu.data_size
                );

                return Err(Error::Pdu(crate::error::PduError::TooLong));
            }

            if fmmu.logical_offset >= candidate_start {
                // Offsets are monotonic, so everything before this point
                // is approved for the current datagram
                valid_start = candidate_start;

                if fmmu.logical_offset + fmmu.data_size - datagram_offset > MAX_PDU_DATA {
                    self.pairs.push(Self::emplace_pair(
                        self.index,
                        &self.fmmu_configs,
                        self.logical_base_address,
                        datagram_offset,
                        valid_start,
                        configs,
                        queue,
                        redundant,
                    ));

                    datagram_offset = valid_start;
                }
            }

            if fmmu.logical_offset + fmmu.data_size > candidate_start {
                candidate_start = fmmu.logical_offset + fmmu.data_size;
            }
        }

        // The remainder, even when the whole image fits one datagram
        if self.size() > datagram_offset {
            self.pairs.push(Self::emplace_pair(
                self.index,
                &self.fmmu_configs,
                self.logical_base_address,
                datagram_offset,
                self.size(),
                configs,
                queue,
                redundant,
            ));
        }

        self.expected_wkc = self.pairs.iter().map(|pair| pair.expected_wkc).sum();

        fmt::info!(
            "domain {}: logical address {:#010x}, {} bytes, expected working counter {}",
            self.index,
            self.logical_base_address,
            self.image.len(),
            self.expected_wkc
        );

        Ok(())
    }

    /// Build one datagram pair covering `[start..end)`.
    #[allow(clippy::too_many_arguments)]
    fn emplace_pair(
        domain_index: usize,
        fmmu_configs: &[DomainFmmu],
        base_address: u32,
        start: usize,
        end: usize,
        configs: &[SlaveConfig],
        queue: &mut PduQueue,
        redundant: bool,
    ) -> DatagramPair {
        let size = end - start;

        let in_range = |fmmu: &&DomainFmmu| {
            fmmu.logical_offset >= start && fmmu.logical_offset < end
        };

        let mut input_configs: SmallVec<[usize; 8]> = SmallVec::new();
        let mut output_configs: SmallVec<[usize; 8]> = SmallVec::new();
        let mut input_fmmus = 0u16;
        let mut output_fmmus = 0u16;

        for fmmu in fmmu_configs.iter().filter(in_range) {
            match fmmu.direction {
                SmDirection::Input => {
                    input_fmmus += 1;

                    if !input_configs.contains(&fmmu.config) {
                        input_configs.push(fmmu.config);
                    }
                }
                SmDirection::Output => {
                    output_fmmus += 1;

                    if !output_configs.contains(&fmmu.config) {
                        output_configs.push(fmmu.config);
                    }
                }
            }
        }

        debug_assert!(input_configs
            .iter()
            .chain(&output_configs)
            .all(|config| *config < configs.len()));

        let address = base_address + start as u32;

        // If LRW is used, output FMMUs count twice and inputs once; the
        // single direction commands count one per contributing FMMU.
        let (mut main, expected_wkc) = if output_fmmus > 0 && input_fmmus > 0 {
            (
                Datagram::lrw(address, size),
                2 * output_configs.len() as u16 + input_configs.len() as u16,
            )
        } else if output_fmmus > 0 {
            (Datagram::lwr(address, size), output_fmmus)
        } else {
            (Datagram::lrd(address, size), input_fmmus)
        };

        main.external_image(ImageRef {
            domain: domain_index,
            offset: start,
            len: size,
        });

        let command = main.command;
        let main = queue.insert(main);

        let backup = redundant.then(|| {
            let mut datagram = Datagram::new(command, size);

            datagram.set_device_index(DeviceIndex::Backup);

            queue.insert(datagram)
        });

        fmt::debug!(
            "domain {}: pair at {:#010x} + {} bytes, expecting {}",
            domain_index,
            address,
            size,
            expected_wkc
        );

        DatagramPair {
            datagrams: [Some(main), backup],
            offset: start,
            size,
            expected_wkc,
            send_buffer: if redundant { vec![0; size] } else { Vec::new() },
        }
    }

    /// Mark all domain datagrams ready for the next `send()`.
    ///
    /// With a backup device the outgoing bytes are also captured for the
    /// redundancy comparison and cloned into the backup datagrams.
    pub(crate) fn queue(&mut self, queue: &mut PduQueue) {
        for pair in &mut self.pairs {
            let window = pair.offset..pair.offset + pair.size;

            if let Some(backup) = pair.datagrams[1] {
                pair.send_buffer.copy_from_slice(&self.image[window.clone()]);

                if let Some(datagram) = queue.get_mut(backup) {
                    datagram.data_mut().copy_from_slice(&self.image[window]);
                }

                queue.queue_datagram(backup);
            }

            if let Some(main) = pair.datagrams[0] {
                queue.queue_datagram(main);
            }
        }
    }

    /// Evaluate the cycle's responses: sum working counters, reconcile
    /// redundant inputs and update the domain state.
    pub(crate) fn process(&mut self, queue: &PduQueue, redundant: bool) {
        let mut wc_sum = [0u16; 2];

        for pair in &mut self.pairs {
            let mut pair_wc = [0u16; 2];

            for (device, handle) in pair.datagrams.iter().enumerate() {
                let Some(datagram) = handle.and_then(|handle| queue.get(handle)) else {
                    continue;
                };

                if datagram.state() == DatagramState::Received {
                    pair_wc[device] = datagram.working_counter();
                }
            }

            if redundant {
                let backup_data = pair.datagrams[1]
                    .and_then(|handle| queue.get(handle))
                    .map(|datagram| datagram.data().to_vec())
                    .unwrap_or_default();

                let pair_total: u16 = pair_wc.iter().sum();

                for fmmu in self.fmmu_configs.iter().filter(|fmmu| {
                    fmmu.direction == SmDirection::Input
                        && fmmu.logical_offset >= pair.offset
                        && fmmu.logical_offset < pair.offset + pair.size
                }) {
                    let local = fmmu.logical_offset - pair.offset;
                    let window = local..local + fmmu.data_size;

                    let sent = &pair.send_buffer[window.clone()];
                    let main =
                        &self.image[fmmu.logical_offset..fmmu.logical_offset + fmmu.data_size];

                    if main != sent {
                        // Main link saw valid updates; nothing to copy
                    } else if backup_data.get(window.clone()).is_some_and(|b| b != sent) {
                        // Backup link saw the updates; adopt them
                        self.image[fmmu.logical_offset..fmmu.logical_offset + fmmu.data_size]
                            .copy_from_slice(&backup_data[window]);
                    } else if pair_total == pair.expected_wkc {
                        // No change but the exchange is complete
                    } else {
                        // No change and incomplete: zero the pair's
                        // working counter to avoid data dependent flicker
                        pair_wc = [0; 2];
                    }
                }
            }

            wc_sum[0] += pair_wc[0];
            wc_sum[1] += pair_wc[1];
        }

        let redundancy = wc_sum[1] > 0;

        if redundancy != self.redundancy_active {
            if redundancy {
                fmt::warning!("domain {}: redundant link in use", self.index);
            } else {
                fmt::info!("domain {}: redundant link unused again", self.index);
            }

            self.redundancy_active = redundancy;
        }

        if wc_sum != self.working_counter {
            self.wc_changes += 1;

            fmt::debug!(
                "domain {}: working counter changed to {}/{}",
                self.index,
                wc_sum[0] + wc_sum[1],
                self.expected_wkc
            );

            self.working_counter = wc_sum;
        }
    }

    /// Application visible state.
    pub fn state(&self) -> DomainState {
        let total = self.working_counter[0] + self.working_counter[1];

        let wc_state = if total == 0 && self.expected_wkc != 0 {
            WcState::Zero
        } else if total >= self.expected_wkc {
            WcState::Complete
        } else {
            WcState::Incomplete
        };

        DomainState {
            working_counter: total,
            wc_state,
            redundancy_active: self.redundancy_active,
        }
    }

    /// Number of datagram pairs, valid after activation.
    #[cfg(test)]
    pub(crate) fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Byte ranges covered by each pair, in order.
    #[cfg(test)]
    pub(crate) fn pair_ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pairs.iter().map(|pair| (pair.offset, pair.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_overlapping_offsets_accumulate() {
        let mut domain = Domain::new(0);

        let a = domain
            .add_fmmu(0, 2, SmDirection::Output, 10, false)
            .unwrap();
        let b = domain.add_fmmu(0, 3, SmDirection::Input, 6, false).unwrap();
        let c = domain
            .add_fmmu(1, 2, SmDirection::Output, 4, false)
            .unwrap();

        assert_eq!((a, b, c), (0, 10, 16));
        assert_eq!(domain.size(), 20);
    }

    #[test]
    fn overlapping_config_shares_bytes() {
        let mut domain = Domain::new(0);

        let out = domain.add_fmmu(0, 2, SmDirection::Output, 10, true).unwrap();
        let inp = domain.add_fmmu(0, 3, SmDirection::Input, 6, true).unwrap();

        // Input and output share the same logical window
        assert_eq!((out, inp), (0, 0));
        assert_eq!(domain.size(), 10);

        // A different config re-bases both cursors
        let next = domain.add_fmmu(1, 2, SmDirection::Output, 4, true).unwrap();

        assert_eq!(next, 10);
        assert_eq!(domain.size(), 14);
    }

    #[test]
    fn partitions_never_split_an_fmmu() {
        let mut domain = Domain::new(0);
        let configs: Vec<SlaveConfig> = (0..5)
            .map(|i| SlaveConfig::new(0, i as u16, 0, 0))
            .collect();

        for i in 0..5 {
            domain
                .add_fmmu(i, 2, SmDirection::Output, 400, false)
                .unwrap();
        }

        let mut queue = PduQueue::new();

        domain.finish(0, &configs, &mut queue, false).unwrap();

        let ranges: Vec<_> = domain.pair_ranges().collect();

        // 2000 bytes of 400 byte windows: three fit below the 1486 byte
        // limit, the remaining two form the second run
        assert_eq!(ranges, vec![(0, 1200), (1200, 800)]);
    }

    #[test]
    fn lrw_expected_wkc_counts_outputs_twice() {
        let mut domain = Domain::new(0);
        let configs: Vec<SlaveConfig> =
            (0..2).map(|i| SlaveConfig::new(0, i as u16, 0, 0)).collect();

        domain.add_fmmu(0, 2, SmDirection::Output, 8, false).unwrap();
        domain.add_fmmu(0, 3, SmDirection::Input, 8, false).unwrap();
        domain.add_fmmu(1, 3, SmDirection::Input, 4, false).unwrap();

        let mut queue = PduQueue::new();

        domain.finish(0, &configs, &mut queue, false).unwrap();

        // One LRW pair: 2 * 1 output config + 2 input configs
        assert_eq!(domain.pair_count(), 1);
        assert_eq!(domain.expected_working_counter(), 4);
    }

    #[test]
    fn redundancy_failover_uses_backup_data() {
        let mut domain = Domain::new(0);
        let configs = vec![SlaveConfig::new(0, 0, 0, 0)];

        domain.add_fmmu(0, 3, SmDirection::Input, 4, false).unwrap();

        let mut queue = PduQueue::new();

        domain.finish(0, &configs, &mut queue, true).unwrap();

        assert_eq!(domain.expected_working_counter(), 1);

        // Fill the cycle's send snapshot
        domain.queue(&mut queue);

        let handles = queue.queued_handles();

        // Main and backup datagrams are both queued
        assert_eq!(handles.len(), 2);

        let backup = handles
            .iter()
            .copied()
            .find(|h| {
                queue.get(*h).unwrap().device_index() == crate::datagram::DeviceIndex::Backup
            })
            .unwrap();

        // The main device dropped the frame; only the backup returns,
        // with fresh input data and a full working counter
        queue.complete_for_test(backup, &[0xde, 0xad, 0xbe, 0xef], 1);

        domain.process(&queue, true);

        let state = domain.state();

        assert_eq!(state.wc_state, WcState::Complete);
        assert!(state.redundancy_active);
        assert_eq!(state.working_counter, 1);

        // The backup's input data was adopted into the process image
        assert_eq!(domain.data(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn single_direction_counts_fmmus() {
        let mut domain = Domain::new(0);
        let configs = vec![SlaveConfig::new(0, 0, 0, 0)];

        domain.add_fmmu(0, 2, SmDirection::Output, 8, false).unwrap();
        domain.add_fmmu(0, 3, SmDirection::Output, 8, false).unwrap();

        let mut queue = PduQueue::new();

        domain.finish(0, &configs, &mut queue, false).unwrap();

        assert_eq!(domain.expected_working_counter(), 2);
    }
}
