/// 键到分区、分区到属主节点的稳定映射
///
/// 属主按最高随机权重哈希选出，成员变化时只迁移离开节点原有的分区，
/// 或者新加入节点胜出的分区。
#[derive(Debug, Clone)]
pub struct PartitionTable {
    partition_count: u32,
}

impl PartitionTable {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn partition_of(&self, key: &str) -> u32 {
        (fnv1a64(key.as_bytes()) % u64::from(self.partition_count)) as u32
    }

    /// 权重最高的成员拥有该分区
    pub fn owner_of_partition<'a, I>(&self, partition: u32, members: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        members
            .into_iter()
            .map(|member| (weight(partition, member), member))
            .max()
            .map(|(_, member)| member)
    }

    pub fn owner_of<'a, I>(&self, key: &str, members: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.owner_of_partition(self.partition_of(key), members)
    }
}

fn weight(partition: u32, member: &str) -> u64 {
    let mut bytes = partition.to_be_bytes().to_vec();
    bytes.extend_from_slice(member.as_bytes());
    fnv1a64(&bytes)
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_for_a_key() {
        let table = PartitionTable::new(271);
        let first = table.partition_of("task-1");
        for _ in 0..10 {
            assert_eq!(table.partition_of("task-1"), first);
        }
        assert!(first < 271);
    }

    #[test]
    fn no_members_means_no_owner() {
        let table = PartitionTable::new(7);
        assert!(table.owner_of("task-1", std::iter::empty()).is_none());
    }

    #[test]
    fn leaving_member_only_moves_its_own_partitions() {
        let table = PartitionTable::new(271);
        let all = ["node-a", "node-b", "node-c"];
        let remaining = ["node-a", "node-c"];

        for partition in 0..271 {
            let before = table
                .owner_of_partition(partition, all.iter().copied())
                .unwrap();
            let after = table
                .owner_of_partition(partition, remaining.iter().copied())
                .unwrap();
            if before != "node-b" {
                assert_eq!(before, after, "分区 {partition} 不应迁移");
            }
        }
    }

    #[test]
    fn partitions_are_spread_across_members() {
        let table = PartitionTable::new(271);
        let members = ["node-a", "node-b", "node-c"];
        let mut counts = [0usize; 3];
        for partition in 0..271 {
            let owner = table
                .owner_of_partition(partition, members.iter().copied())
                .unwrap();
            let index = members.iter().position(|m| *m == owner).unwrap();
            counts[index] += 1;
        }
        assert!(counts.iter().all(|count| *count > 0));
    }
}
