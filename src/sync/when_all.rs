use crate::join::{when_ready, Join};
use crate::task::{spawn, Task};

/// Produces a task that completes once every element of `tasks` is ready,
/// yielding the elements back (results still inside) in input order.
///
/// Children run eagerly on their own, so awaiting them one after another
/// costs one pass and no fan-out.
pub fn when_all<J>(tasks: Vec<J>) -> Task<Vec<J>>
where
    J: Join + Send + 'static,
{
    spawn(async move {
        for i in 0..tasks.len() {
            when_ready(&tasks[i]).await;
        }
        tasks
    })
}

/// Tuple variants of [`when_all`] and [`when_any`](crate::when_any):
/// `(a, b).when_all()` resolves to the tuple once both are ready.
pub trait JoinTuple: Sized + Send + 'static {
    fn when_all(self) -> Task<Self>;

    fn when_any(self) -> Task<crate::WhenAny<Self>>;
}

macro_rules! impl_join_tuple {
    ($($J:ident . $idx:tt),+) => {
        impl<$($J),+> JoinTuple for ($($J,)+)
        where
            $($J: Join + Send + 'static,)+
        {
            fn when_all(self) -> Task<Self> {
                spawn(async move {
                    $(when_ready(&self.$idx).await;)+
                    self
                })
            }

            fn when_any(self) -> Task<crate::WhenAny<Self>> {
                let followers = vec![$(self.$idx.follower(),)+];
                crate::sync::when_any::when_any_impl(self, followers)
            }
        }
    };
}

impl_join_tuple!(A.0);
impl_join_tuple!(A.0, B.1);
impl_join_tuple!(A.0, B.1, C.2);
impl_join_tuple!(A.0, B.1, C.2, D.3);
impl_join_tuple!(A.0, B.1, C.2, D.3, E.4);
impl_join_tuple!(A.0, B.1, C.2, D.3, E.4, F.5);
impl_join_tuple!(A.0, B.1, C.2, D.3, E.4, F.5, G.6);
impl_join_tuple!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);
