use super::CollectiveCommunicator;
use candle_core::{Result, Tensor};
use std::sync::{Arc, Barrier, Mutex};

/// Identity backend for world size 1.
pub struct NullCommunicator;

impl CollectiveCommunicator for NullCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, _root_rank: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// In-process communicator backed by a thread barrier. One handle per
/// worker thread; every collective is a rendezvous of the whole group.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[self.rank] = Some(tensor.clone());
        }

        self.shared.barrier.wait();

        let sum = {
            let buffers = self.shared.buffers.lock().unwrap();
            let mut sum = buffers[0].as_ref().unwrap().clone();
            for i in 1..self.world_size {
                sum = (sum + buffers[i].as_ref().unwrap())?;
            }
            sum
        };

        // Everyone must have read before the buffers are reused.
        self.shared.barrier.wait();

        Ok(sum)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[self.rank] = Some(tensor.clone());
        }

        self.shared.barrier.wait();

        let gathered = {
            let buffers = self.shared.buffers.lock().unwrap();
            let tensors: Vec<&Tensor> = buffers.iter().map(|t| t.as_ref().unwrap()).collect();
            Tensor::cat(&tensors, 0)?
        };

        self.shared.barrier.wait();

        Ok(gathered)
    }

    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor> {
        if self.rank == root_rank {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers[root_rank] = Some(tensor.clone());
        }

        self.shared.barrier.wait();

        let result = {
            let buffers = self.shared.buffers.lock().unwrap();
            buffers[root_rank].as_ref().unwrap().clone()
        };

        self.shared.barrier.wait();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_null_identity() -> Result<()> {
        let comm = NullCommunicator;
        let t = Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?;
        let r = comm.all_reduce(&t)?;
        assert_eq!(t.to_vec1::<f32>()?, r.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_all_reduce_sums_ranks() -> Result<()> {
        let world_size = 4;
        let comms = LocalCommunicator::new_group(world_size);

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let device = Device::Cpu;
                    let t = Tensor::new(&[(comm.rank() + 1) as f32], &device).unwrap();
                    let res = comm.all_reduce(&t).unwrap();
                    res.get(0).unwrap().to_scalar::<f32>().unwrap()
                })
            })
            .collect();

        for h in handles {
            // 1 + 2 + 3 + 4
            assert_eq!(h.join().unwrap(), 10.0);
        }
        Ok(())
    }

    #[test]
    fn test_broadcast_from_root() -> Result<()> {
        let comms = LocalCommunicator::new_group(2);

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let device = Device::Cpu;
                    let t = Tensor::new(&[comm.rank() as f32 + 7.0], &device).unwrap();
                    let res = comm.broadcast(&t, 0).unwrap();
                    res.get(0).unwrap().to_scalar::<f32>().unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 7.0);
        }
        Ok(())
    }
}
