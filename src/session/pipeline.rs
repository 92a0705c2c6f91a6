//! Seller-side piece delivery pipeline.

use std::collections::VecDeque;

use crate::protocol::messages::PieceData;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    // Before a request is made to load the piece data.
    NotRequested,
    // A load request went out to the client.
    Loading,
    // Data is in hand, waiting for its turn on the wire.
    ReadyToSend(PieceData),
    // Delivered; stays in the pipeline until the next payment.
    WaitingForPayment,
}

#[derive(Debug, Clone)]
struct Piece {
    index: u32,
    stage: Stage,
}

/// FIFO staging every requested piece through
/// `NotRequested -> Loading -> ReadyToSend -> WaitingForPayment`.
/// Pieces are delivered strictly in request order; a payment pops the
/// front entry whatever its stage, which tolerates polite payments for
/// pieces that were never delivered.
#[derive(Debug, Default)]
pub(crate) struct PieceDeliveryPipeline {
    pipeline: VecDeque<Piece>,
}

impl PieceDeliveryPipeline {
    pub(crate) fn new() -> PieceDeliveryPipeline {
        PieceDeliveryPipeline {
            pipeline: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pipeline.len()
    }

    /// Appends a request; returns the new pipeline length.
    pub(crate) fn add(&mut self, index: u32) -> usize {
        self.pipeline.push_back(Piece {
            index,
            stage: Stage::NotRequested,
        });
        self.pipeline.len()
    }

    /// Advances `NotRequested` entries within the front window (at most
    /// `max_pieces_being_serviced + 1` entries) to `Loading`, returning
    /// the indexes to load.
    pub(crate) fn get_next_batch_to_load(&mut self, max_pieces_being_serviced: usize) -> Vec<u32> {
        let mut pieces = Vec::new();
        for (n, piece) in self.pipeline.iter_mut().enumerate() {
            if n > max_pieces_being_serviced {
                break;
            }
            if piece.stage == Stage::NotRequested {
                pieces.push(piece.index);
                piece.stage = Stage::Loading;
            }
        }
        pieces
    }

    /// Fills data for every `Loading` entry with this index. The same
    /// index may legitimately appear more than once; all occurrences get
    /// the same bytes. A non-matching call is not an error: the request
    /// may already have been popped by a polite payment.
    pub(crate) fn data_ready(&mut self, index: u32, data: &PieceData) -> usize {
        let mut pieces_updated = 0;
        for piece in self.pipeline.iter_mut() {
            if piece.index == index && piece.stage == Stage::Loading {
                piece.stage = Stage::ReadyToSend(data.clone());
                pieces_updated += 1;
            }
        }
        pieces_updated
    }

    /// Collects ready front pieces (at most `max_pieces_unpaid_for + 1`
    /// positions), advancing each to `WaitingForPayment`. Stops at the
    /// first entry still `NotRequested` or `Loading`, because pieces go
    /// out in the order they were requested.
    pub(crate) fn get_next_batch_to_send(&mut self, max_pieces_unpaid_for: usize) -> Vec<PieceData> {
        let mut pieces = Vec::new();
        for (n, piece) in self.pipeline.iter_mut().enumerate() {
            if n > max_pieces_unpaid_for {
                break;
            }
            match &piece.stage {
                Stage::NotRequested | Stage::Loading => break,
                Stage::WaitingForPayment => {}
                Stage::ReadyToSend(_) => {
                    if let Stage::ReadyToSend(data) =
                        std::mem::replace(&mut piece.stage, Stage::WaitingForPayment)
                    {
                        pieces.push(data);
                    }
                }
            }
        }
        pieces
    }

    /// A payment arrived: pop the front entry no matter its stage. Has no
    /// effect on an empty pipeline.
    pub(crate) fn payment_received(&mut self) {
        self.pipeline.pop_front();
    }

    pub(crate) fn number_waiting_for_payment(&self) -> usize {
        self.pipeline
            .iter()
            .filter(|p| p.stage == Stage::WaitingForPayment)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(byte: u8) -> PieceData {
        PieceData(vec![byte; 4])
    }

    #[test]
    fn test_load_window_covers_max_plus_one_entries() {
        let mut pipeline = PieceDeliveryPipeline::new();
        for index in 0..10 {
            pipeline.add(index);
        }
        // window of 5 + 1 entries
        assert_eq!(pipeline.get_next_batch_to_load(5), vec![0, 1, 2, 3, 4, 5]);
        // nothing left in the window
        assert!(pipeline.get_next_batch_to_load(5).is_empty());
    }

    #[test]
    fn test_sending_stops_at_first_unready_entry() {
        let mut pipeline = PieceDeliveryPipeline::new();
        for index in 0..4 {
            pipeline.add(index);
        }
        pipeline.get_next_batch_to_load(5);
        pipeline.data_ready(0, &data(0));
        pipeline.data_ready(2, &data(2));

        // piece 1 is still loading, so only piece 0 may go out
        assert_eq!(pipeline.get_next_batch_to_send(3), vec![data(0)]);
        assert_eq!(pipeline.number_waiting_for_payment(), 1);

        pipeline.data_ready(1, &data(1));
        assert_eq!(pipeline.get_next_batch_to_send(3), vec![data(1), data(2)]);
    }

    #[test]
    fn test_send_window_bounds_unpaid_pieces() {
        let mut pipeline = PieceDeliveryPipeline::new();
        for index in 0..6 {
            pipeline.add(index);
            pipeline.get_next_batch_to_load(9);
            pipeline.data_ready(index, &data(index as u8));
        }
        // at most 3 + 1 positions are walked
        assert_eq!(pipeline.get_next_batch_to_send(3).len(), 4);
        assert_eq!(pipeline.number_waiting_for_payment(), 4);
        // no progress until a payment pops the front
        assert!(pipeline.get_next_batch_to_send(3).is_empty());
        pipeline.payment_received();
        assert_eq!(pipeline.get_next_batch_to_send(3).len(), 1);
    }

    #[test]
    fn test_duplicate_index_gets_data_once_per_entry() {
        let mut pipeline = PieceDeliveryPipeline::new();
        pipeline.add(7);
        pipeline.add(7);
        pipeline.get_next_batch_to_load(5);
        assert_eq!(pipeline.data_ready(7, &data(7)), 2);
        assert_eq!(pipeline.get_next_batch_to_send(3), vec![data(7), data(7)]);
    }

    #[test]
    fn test_payment_pops_front_unconditionally() {
        let mut pipeline = PieceDeliveryPipeline::new();
        // a polite payment on an empty pipeline is ignored
        pipeline.payment_received();

        pipeline.add(0);
        pipeline.add(1);
        // front never loaded, a polite payment still pops it
        pipeline.payment_received();
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.get_next_batch_to_load(5), vec![1]);
    }
}
